/// Password strength rules
///
/// Pure checks, no I/O. `validate` enforces composition and rejects weak
/// patterns; `contains_identity` rejects passwords built from the user's own
/// email or name.
use crate::error::{IdentityError, IdentityResult};

pub const MIN_LENGTH: usize = 8;
pub const MAX_LENGTH: usize = 128;

/// Rejected anywhere inside a password, case-insensitively
const COMMON_PASSWORDS: &[&str] = &[
    "password", "passw0rd", "123456", "qwerty", "letmein", "welcome", "iloveyou", "admin",
    "monkey", "dragon", "football", "baseball", "sunshine", "princess", "trustno1", "master",
    "shadow", "superman", "abc123", "changeme",
];

/// Runs of three consecutive characters from any of these are rejected, either direction
const SEQUENCES: &[&str] = &[
    "abcdefghijklmnopqrstuvwxyz",
    "01234567890",
    "qwertyuiop",
    "asdfghjkl",
    "zxcvbnm",
];

/// Outcome of a strength check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordCheck {
    pub valid: bool,
    pub violations: Vec<String>,
}

impl PasswordCheck {
    pub fn into_result(self) -> IdentityResult<()> {
        if self.valid {
            Ok(())
        } else {
            Err(IdentityError::WeakPassword(self.violations))
        }
    }
}

pub fn validate(password: &str) -> PasswordCheck {
    let mut violations = Vec::new();
    let length = password.chars().count();

    if length < MIN_LENGTH {
        violations.push(format!("Password must be at least {} characters", MIN_LENGTH));
    }
    if length > MAX_LENGTH {
        violations.push(format!("Password must be at most {} characters", MAX_LENGTH));
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        violations.push("Password must contain an uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        violations.push("Password must contain a lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push("Password must contain a digit".to_string());
    }
    if !password.chars().any(|c| !c.is_alphanumeric()) {
        violations.push("Password must contain a symbol".to_string());
    }

    let lower = password.to_lowercase();
    if let Some(common) = COMMON_PASSWORDS.iter().find(|p| lower.contains(*p)) {
        violations.push(format!("Password contains a common password ({})", common));
    }
    if let Some(run) = sequential_run(&lower) {
        violations.push(format!("Password contains a sequential pattern ({})", run));
    }

    PasswordCheck {
        valid: violations.is_empty(),
        violations,
    }
}

/// True when any identity token of three or more characters appears in the password
pub fn contains_identity<S: AsRef<str>>(password: &str, identity_tokens: &[S]) -> bool {
    let lower = password.to_lowercase();
    identity_tokens
        .iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| t.chars().count() >= 3)
        .any(|t| lower.contains(&t))
}

/// Email local-part, the full display name and each word of it
pub fn identity_tokens(email: &str, name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    if let Some(local) = email.split('@').next() {
        tokens.push(local.to_string());
    }
    tokens.push(name.to_string());
    tokens.extend(name.split_whitespace().map(str::to_string));
    tokens
}

/// Full strength check plus identity check
pub fn check_new_password(password: &str, email: &str, name: &str) -> IdentityResult<()> {
    let mut check = validate(password);
    if contains_identity(password, &identity_tokens(email, name)) {
        check.valid = false;
        check
            .violations
            .push("Password must not contain your name or email".to_string());
    }
    check.into_result()
}

fn sequential_run(lower: &str) -> Option<String> {
    let chars: Vec<char> = lower.chars().collect();
    chars.windows(3).find_map(|w| {
        let forward: String = w.iter().collect();
        let backward: String = w.iter().rev().collect();
        SEQUENCES
            .iter()
            .any(|s| s.contains(&forward) || s.contains(&backward))
            .then_some(forward)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strong_password_passes() {
        let check = validate("Tr0ub4dor&Zq");
        assert!(check.valid, "{:?}", check.violations);
        assert!(check.violations.is_empty());
    }

    #[test]
    fn test_length_bounds() {
        assert!(!validate("Aa1!").valid);
        let long = format!("Tr0ub4dor&Zq{}", "x".repeat(MAX_LENGTH));
        let check = validate(&long);
        assert!(check.violations.iter().any(|v| v.contains("at most")));
    }

    #[test]
    fn test_composition_rules() {
        assert!(!validate("tr0ub4dor&zq").valid);
        assert!(!validate("TR0UB4DOR&ZQ").valid);
        assert!(!validate("Troubxdor&Zq").valid);
        assert!(!validate("Tr0ub4dorxZq").valid);
    }

    #[test]
    fn test_common_password_substring() {
        let check = validate("MyPassword9!");
        assert!(!check.valid);
        assert!(check.violations.iter().any(|v| v.contains("common")));
    }

    #[test]
    fn test_sequences_both_directions() {
        assert!(!validate("Xk9!abcQz").valid);
        assert!(!validate("Xk9!CBAqz").valid);
        assert!(!validate("Xk!987Qzv").valid);
        assert!(!validate("Xk9!Qwez").valid);
        assert!(!validate("Xk9!lkjZz").valid);
    }

    /// Rule set restated independently of `validate`
    fn meets_every_rule(candidate: &str) -> bool {
        let len = candidate.chars().count();
        let lower = candidate.to_lowercase();
        let chars: Vec<char> = lower.chars().collect();
        let has_run = SEQUENCES.iter().any(|seq| {
            let seq: Vec<char> = seq.chars().collect();
            seq.windows(3).any(|triple| {
                chars.windows(3).any(|w| w == triple || w.iter().rev().eq(triple.iter()))
            })
        });

        (MIN_LENGTH..=MAX_LENGTH).contains(&len)
            && candidate.chars().any(|c| c.is_uppercase())
            && candidate.chars().any(|c| c.is_lowercase())
            && candidate.chars().any(|c| c.is_ascii_digit())
            && candidate.chars().any(|c| !c.is_alphanumeric())
            && !COMMON_PASSWORDS.iter().any(|p| lower.contains(p))
            && !has_run
    }

    #[test]
    fn test_validate_agrees_with_rules_on_random_candidates() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        const ALPHABET: &[u8] =
            b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*-_=+?";
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut accepted = 0;

        for _ in 0..5000 {
            let len = rng.gen_range(0..=24);
            let candidate: String = (0..len)
                .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                .collect();

            let check = validate(&candidate);
            assert_eq!(
                check.valid,
                meets_every_rule(&candidate),
                "{:?}: {:?}",
                candidate,
                check.violations
            );
            assert_eq!(check.valid, check.violations.is_empty());
            if check.valid {
                accepted += 1;
            }
        }

        assert!(accepted > 0);
    }

    #[test]
    fn test_validate_agrees_with_rules_at_every_length() {
        // Filler with no three-character runs from any sequence
        let filler = ['x', 'm', 'q', '7', 'w', '!'];
        for len in (MIN_LENGTH - 1)..=(MAX_LENGTH + 1) {
            let mut candidate = String::from("Zq4#");
            while candidate.chars().count() < len {
                candidate.push(filler[candidate.len() % filler.len()]);
            }
            let candidate: String = candidate.chars().take(len).collect();

            let expected = (MIN_LENGTH..=MAX_LENGTH).contains(&len);
            assert_eq!(validate(&candidate).valid, expected, "length {}", len);
            assert_eq!(meets_every_rule(&candidate), expected, "length {}", len);
        }
    }

    #[test]
    fn test_dropping_any_class_is_rejected() {
        let base = "Tr0ub4dor&Zq";
        assert!(validate(base).valid);

        let classes: [fn(char) -> bool; 4] = [
            |c: char| c.is_uppercase(),
            |c: char| c.is_lowercase(),
            |c: char| c.is_ascii_digit(),
            |c: char| !c.is_alphanumeric(),
        ];
        for drop_class in classes {
            // Swap the class out for a character of another class, keeping the length
            let candidate: String = base
                .chars()
                .map(|c| match (drop_class(c), c.is_ascii_digit()) {
                    (true, true) => 'k',
                    (true, false) => '9',
                    (false, _) => c,
                })
                .collect();
            assert!(!validate(&candidate).valid, "{}", candidate);
            assert!(!meets_every_rule(&candidate), "{}", candidate);
        }
    }

    #[test]
    fn test_identity_rejected() {
        let tokens = identity_tokens("jane@x.com", "Jane Doe");
        assert!(contains_identity("Jane12345!", &tokens));
        assert!(contains_identity("xxDOEyy", &tokens));
        assert!(!contains_identity("Tr0ub4dor&Zq", &tokens));
        assert!(check_new_password("Jane12345!", "jane@x.com", "Jane Doe").is_err());
    }

    #[test]
    fn test_short_identity_tokens_ignored() {
        assert!(!contains_identity("Tr0ub4dor&Zq", &["al", "Tr"]));
    }
}

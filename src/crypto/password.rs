/// Argon2id password hashing
use crate::{
    config::HashCost,
    error::{IdentityError, IdentityResult},
};
use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

/// Hashes and verifies passwords off the async executor
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    /// Verified against when an account is unknown so both paths cost the same
    dummy_hash: String,
}

impl PasswordHasher {
    pub fn new(cost: HashCost) -> IdentityResult<Self> {
        let params = Params::new(cost.memory_kib, cost.iterations, 1, None)
            .map_err(|e| IdentityError::Internal(format!("Invalid Argon2 parameters: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let dummy_hash = hash_with(&argon2, "homestead-timing-equalizer")?;

        Ok(Self { argon2, dummy_hash })
    }

    /// Hash a password into a PHC string
    pub async fn hash(&self, plain: &str) -> IdentityResult<String> {
        let argon2 = self.argon2.clone();
        let plain = plain.to_string();
        tokio::task::spawn_blocking(move || hash_with(&argon2, &plain))
            .await
            .map_err(|e| IdentityError::Internal(format!("Hashing task failed: {}", e)))?
    }

    /// Check a password against a stored PHC string
    pub async fn verify(&self, plain: &str, hash: &str) -> IdentityResult<bool> {
        let argon2 = self.argon2.clone();
        let plain = plain.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || {
            let parsed = match PasswordHash::new(&hash) {
                Ok(h) => h,
                Err(_) => return false,
            };
            argon2.verify_password(plain.as_bytes(), &parsed).is_ok()
        })
        .await
        .map_err(|e| IdentityError::Internal(format!("Verification task failed: {}", e)))
    }

    /// Burn one verification so unknown accounts answer as slowly as known ones
    pub async fn dummy_verify(&self, plain: &str) {
        let _ = self.verify(plain, &self.dummy_hash).await;
    }
}

fn hash_with(argon2: &Argon2<'_>, plain: &str) -> IdentityResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(plain.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| IdentityError::Internal(format!("Password hashing failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> PasswordHasher {
        PasswordHasher::new(HashCost {
            memory_kib: 1024,
            iterations: 1,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_hash_and_verify() {
        let hasher = cheap();
        let hash = hasher.hash("Tr0ub4dor&Zq").await.unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("Tr0ub4dor&Zq"));
        assert!(hasher.verify("Tr0ub4dor&Zq", &hash).await.unwrap());
        assert!(!hasher.verify("tr0ub4dor&zq", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_rejects_malformed_hash() {
        let hasher = cheap();
        assert!(!hasher.verify("anything", "not-a-phc-string").await.unwrap());
    }
}

/// Access and refresh token minting and verification
///
/// Both kinds are HS256 JWTs carrying a required `typ` discriminator and are
/// signed with separate secrets, so one kind can never stand in for the other.
/// Expiry is checked against the injected clock rather than the system time.
use crate::{
    clock::{to_chrono, SharedClock},
    config::AuthConfig,
    error::{IdentityError, IdentityResult},
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// JWT claims. `typ` has no default: a token without it fails to decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub typ: TokenKind,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl Claims {
    pub fn issued_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.iat, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Freshly minted access/refresh pair
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

pub struct TokenSigner {
    access: KeyPair,
    refresh: KeyPair,
    clock: SharedClock,
}

impl TokenSigner {
    pub fn new(config: &AuthConfig, clock: SharedClock) -> Self {
        let keys = |secret: &str, ttl| KeyPair {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: to_chrono(ttl),
        };

        Self {
            access: keys(&config.access_secret, config.access_token_ttl),
            refresh: keys(&config.refresh_secret, config.refresh_token_ttl),
            clock,
        }
    }

    fn keys(&self, kind: TokenKind) -> &KeyPair {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    /// Mint one token of `kind` for `subject`
    pub fn mint(&self, subject: &str, kind: TokenKind) -> IdentityResult<(String, DateTime<Utc>)> {
        let now = self.clock.now();
        let keys = self.keys(kind);
        let expires_at = now + keys.ttl;

        let claims = Claims {
            sub: subject.to_string(),
            typ: kind,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: match kind {
                TokenKind::Refresh => Some(Uuid::new_v4().to_string()),
                TokenKind::Access => None,
            },
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| IdentityError::Jwt(format!("Failed to sign {} token: {}", kind.as_str(), e)))?;

        Ok((token, expires_at))
    }

    /// Mint an access token and a refresh token for `subject`
    pub fn issue_pair(&self, subject: &str) -> IdentityResult<TokenPair> {
        let issued_at = self.clock.now();
        let (access_token, _) = self.mint(subject, TokenKind::Access)?;
        let (refresh_token, refresh_expires_at) = self.mint(subject, TokenKind::Refresh)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            issued_at,
            refresh_expires_at,
        })
    }

    /// Check signature and type discriminator, ignoring expiry
    pub fn decode(&self, token: &str, kind: TokenKind) -> IdentityResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;

        let data = decode::<Claims>(token, &self.keys(kind).decoding, &validation).map_err(|e| {
            tracing::debug!("{} token rejected: {}", kind.as_str(), e);
            IdentityError::Authentication("Invalid token".to_string())
        })?;

        if data.claims.typ != kind {
            return Err(IdentityError::Authentication("Invalid token type".to_string()));
        }

        Ok(data.claims)
    }

    /// Full verification: signature, type and expiry
    pub fn verify(&self, token: &str, kind: TokenKind) -> IdentityResult<Claims> {
        let claims = self.decode(token, kind)?;
        if claims.exp <= self.clock.now().timestamp() {
            return Err(IdentityError::Authentication("Token has expired".to_string()));
        }
        Ok(claims)
    }
}

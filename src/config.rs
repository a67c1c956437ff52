/// Configuration management for the Homestead identity service
use crate::error::{IdentityError, IdentityResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub lockout: LockoutConfig,
    pub trial: TrialConfig,
    pub email: Option<EmailConfig>,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
    /// Base URL used in emailed links
    pub public_url: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database: PathBuf,
    /// Upper bound on any single storage call; exceeding it fails the request closed
    pub timeout: Duration,
}

/// Argon2 cost parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub max_sessions_per_account: u32,
    pub reset_token_ttl: Duration,
    pub hash_cost: HashCost,
}

/// Durable account lockout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutConfig {
    pub max_failed_attempts: u32,
    pub lock_duration: Duration,
}

/// Trial entitlement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialConfig {
    pub duration: Duration,
    pub reminder_lead: Duration,
    pub listings_quota: i64,
    pub free_listings_quota: i64,
}

/// Email configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_url: String,
    pub from_address: String,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub global_requests_per_minute: u32,
    /// Shared counter store; in-memory when unset
    pub redis_url: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let hostname = "127.0.0.1".to_string();
        let port = 3000;
        let data_directory = PathBuf::from("./data");

        Self {
            service: ServiceConfig {
                public_url: format!("http://{}:{}", hostname, port),
                hostname,
                port,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            storage: StorageConfig {
                database: data_directory.join("homestead.sqlite"),
                data_directory,
                timeout: Duration::from_secs(5),
            },
            authentication: AuthConfig {
                jwt_secret: String::new(),
                access_secret: String::new(),
                refresh_secret: String::new(),
                access_token_ttl: Duration::from_secs(15 * 60),
                refresh_token_ttl: Duration::from_secs(7 * 86400),
                max_sessions_per_account: 5,
                reset_token_ttl: Duration::from_secs(3600),
                hash_cost: HashCost {
                    memory_kib: 19456,
                    iterations: 2,
                },
            },
            lockout: LockoutConfig {
                max_failed_attempts: 5,
                lock_duration: Duration::from_secs(30 * 60),
            },
            trial: TrialConfig {
                duration: Duration::from_secs(7 * 86400),
                reminder_lead: Duration::from_secs(3 * 86400),
                listings_quota: 10,
                free_listings_quota: 3,
            },
            email: None,
            rate_limit: RateLimitConfig {
                enabled: true,
                global_requests_per_minute: 3000,
                redis_url: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> IdentityResult<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();

        let hostname = env::var("HOMESTEAD_HOSTNAME").unwrap_or(defaults.service.hostname);
        let port = env::var("HOMESTEAD_PORT")
            .unwrap_or_else(|_| defaults.service.port.to_string())
            .parse()
            .map_err(|_| IdentityError::Validation("Invalid port number".to_string()))?;
        let public_url = env::var("PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", hostname, port));

        let data_directory: PathBuf = env::var("HOMESTEAD_DATA_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage.data_directory);
        let database = env::var("HOMESTEAD_DATABASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("homestead.sqlite"));
        let storage_timeout = env_duration("STORAGE_TIMEOUT", defaults.storage.timeout)?;

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| IdentityError::Validation("JWT secret required".to_string()))?;
        // Per-kind secrets fall back to the shared one
        let access_secret = env::var("JWT_ACCESS_SECRET").unwrap_or_else(|_| jwt_secret.clone());
        let refresh_secret =
            env::var("JWT_REFRESH_SECRET").unwrap_or_else(|_| jwt_secret.clone());

        let auth = defaults.authentication;
        let access_token_ttl = env_duration("ACCESS_TOKEN_TTL", auth.access_token_ttl)?;
        let refresh_token_ttl = env_duration("REFRESH_TOKEN_TTL", auth.refresh_token_ttl)?;
        let max_sessions_per_account = env_parse("MAX_SESSIONS_PER_ACCOUNT", auth.max_sessions_per_account);
        let reset_token_ttl = env_duration("PASSWORD_RESET_TTL", auth.reset_token_ttl)?;
        let hash_cost = HashCost {
            memory_kib: env_parse("ARGON2_MEMORY_KIB", auth.hash_cost.memory_kib),
            iterations: env_parse("ARGON2_ITERATIONS", auth.hash_cost.iterations),
        };

        let lockout = LockoutConfig {
            max_failed_attempts: env_parse("LOCKOUT_MAX_ATTEMPTS", defaults.lockout.max_failed_attempts),
            lock_duration: env_duration("LOCKOUT_DURATION", defaults.lockout.lock_duration)?,
        };

        let trial = TrialConfig {
            duration: env_duration("TRIAL_DURATION", defaults.trial.duration)?,
            reminder_lead: env_duration("TRIAL_REMINDER_LEAD", defaults.trial.reminder_lead)?,
            listings_quota: env_parse("TRIAL_LISTINGS_QUOTA", defaults.trial.listings_quota),
            free_listings_quota: env_parse("FREE_LISTINGS_QUOTA", defaults.trial.free_listings_quota),
        };

        let email = if let Ok(smtp_url) = env::var("SMTP_URL") {
            Some(EmailConfig {
                smtp_url,
                from_address: env::var("EMAIL_FROM_ADDRESS")
                    .unwrap_or_else(|_| format!("noreply@{}", hostname)),
            })
        } else {
            None
        };

        let rate_limit = RateLimitConfig {
            enabled: env_parse("RATE_LIMITS_ENABLED", true),
            global_requests_per_minute: env_parse(
                "RATE_LIMIT_GLOBAL_REQUESTS_PER_MINUTE",
                defaults.rate_limit.global_requests_per_minute,
            ),
            redis_url: env::var("RATE_LIMIT_REDIS_URL").ok().filter(|s| !s.is_empty()),
        };

        let logging = LoggingConfig {
            level: env::var("RUST_LOG").unwrap_or(defaults.logging.level),
            json: env::var("LOG_FORMAT")
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        };

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                version: defaults.service.version,
                public_url,
            },
            storage: StorageConfig {
                data_directory,
                database,
                timeout: storage_timeout,
            },
            authentication: AuthConfig {
                jwt_secret,
                access_secret,
                refresh_secret,
                access_token_ttl,
                refresh_token_ttl,
                max_sessions_per_account,
                reset_token_ttl,
                hash_cost,
            },
            lockout,
            trial,
            email,
            rate_limit,
            logging,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> IdentityResult<()> {
        if self.service.hostname.is_empty() {
            return Err(IdentityError::Validation("Hostname cannot be empty".to_string()));
        }

        let auth = &self.authentication;
        for (name, secret) in [
            ("JWT secret", &auth.jwt_secret),
            ("Access token secret", &auth.access_secret),
            ("Refresh token secret", &auth.refresh_secret),
        ] {
            if secret.len() < 32 {
                return Err(IdentityError::Validation(format!(
                    "{} must be at least 32 characters",
                    name
                )));
            }
        }

        for (name, value) in [
            ("Storage timeout", self.storage.timeout),
            ("Access token TTL", auth.access_token_ttl),
            ("Refresh token TTL", auth.refresh_token_ttl),
            ("Reset token TTL", auth.reset_token_ttl),
            ("Lock duration", self.lockout.lock_duration),
            ("Trial duration", self.trial.duration),
            ("Trial reminder lead", self.trial.reminder_lead),
        ] {
            if value > MAX_CONFIGURED_DURATION {
                return Err(IdentityError::Validation(format!(
                    "{} must not exceed {} days",
                    name,
                    MAX_CONFIGURED_DURATION.as_secs() / 86400
                )));
            }
        }

        if auth.access_token_ttl >= auth.refresh_token_ttl {
            return Err(IdentityError::Validation(
                "Access token TTL must be shorter than refresh token TTL".to_string(),
            ));
        }

        if auth.max_sessions_per_account == 0 {
            return Err(IdentityError::Validation(
                "At least one session per account must be allowed".to_string(),
            ));
        }

        if self.lockout.max_failed_attempts == 0 {
            return Err(IdentityError::Validation(
                "Lockout threshold must be positive".to_string(),
            ));
        }

        if self.trial.reminder_lead >= self.trial.duration {
            return Err(IdentityError::Validation(
                "Trial reminder lead must be shorter than the trial".to_string(),
            ));
        }

        Ok(())
    }

    /// Configuration for tests and local tooling: fixed secrets, cheap hashing
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        let secret = "test-secret-0123456789abcdefghijklmnop".to_string();
        config.authentication.jwt_secret = secret.clone();
        config.authentication.access_secret = format!("{}-access", secret);
        config.authentication.refresh_secret = format!("{}-refresh", secret);
        config.authentication.hash_cost = HashCost {
            memory_kib: 1024,
            iterations: 1,
        };
        config
    }
}

/// Upper bound for any configured span; keeps `now + span` inside chrono's range
pub const MAX_CONFIGURED_DURATION: Duration = Duration::from_secs(3650 * 86400);

/// Parse a TTL string such as "30s", "15m", "2h" or "7d". A bare number is seconds.
pub fn parse_duration(value: &str) -> IdentityResult<Duration> {
    let value = value.trim();
    let invalid = || IdentityError::Validation(format!("Invalid duration: {:?}", value));

    let (digits, multiplier) = match value.char_indices().last() {
        Some((idx, 's')) => (&value[..idx], 1),
        Some((idx, 'm')) => (&value[..idx], 60),
        Some((idx, 'h')) => (&value[..idx], 3600),
        Some((idx, 'd')) => (&value[..idx], 86400),
        Some(_) => (value, 1),
        None => return Err(invalid()),
    };

    let amount: u64 = digits.trim().parse().map_err(|_| invalid())?;
    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> IdentityResult<Duration> {
    match env::var(key) {
        Ok(value) => parse_duration(&value),
        Err(_) => Ok(default),
    }
}

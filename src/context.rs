/// Application context and dependency injection
use crate::{
    account::AccountManager,
    clock::{SharedClock, SystemClock},
    config::ServerConfig,
    db,
    error::{IdentityError, IdentityResult},
    lockout::{AccountLockout, LockoutPolicy},
    mailer::{Mailer, Notifier},
    rate_limit::{AuthRateLimiter, GlobalThrottle, MemoryStore, RateLimitStore, RedisStore},
    sessions::SessionStore,
    tokens::TokenSigner,
    trial::{TrialEngine, TrialPolicy},
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub clock: SharedClock,
    pub account_manager: Arc<AccountManager>,
    pub sessions: Arc<SessionStore>,
    pub lockout: Arc<AccountLockout>,
    // Rate limiting
    pub rate_limiter: Arc<AuthRateLimiter>,
    pub throttle: GlobalThrottle,
    // Trial lifecycle and outbound notifications
    pub trial_engine: Arc<TrialEngine>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> IdentityResult<Self> {
        // Validate configuration
        config.validate()?;

        // Create data directory if it doesn't exist
        if !config.storage.data_directory.exists() {
            tokio::fs::create_dir_all(&config.storage.data_directory)
                .await
                .map_err(|e| {
                    IdentityError::Internal(format!(
                        "Failed to create directory {:?}: {}",
                        config.storage.data_directory, e
                    ))
                })?;
        }

        // Initialize database and run migrations
        let db = db::create_pool(&config.storage.database, db::DatabaseOptions::default()).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        // Rate limit counters are shared through Redis when configured
        let store: Arc<dyn RateLimitStore> = match &config.rate_limit.redis_url {
            Some(url) => {
                tracing::info!("Using Redis for rate limit counters");
                Arc::new(RedisStore::connect(url).await?)
            }
            None => Arc::new(MemoryStore::new()),
        };

        // Initialize mailer
        let mailer = Mailer::new(config.email.clone(), config.service.public_url.clone())?;
        if !mailer.is_configured() {
            tracing::warn!("SMTP not configured; notifications will be logged and skipped");
        }

        Self::from_parts(config, db, Arc::new(SystemClock), Arc::new(mailer), store)
    }

    /// Wire services over an existing pool, clock, notifier and counter store
    pub fn from_parts(
        config: ServerConfig,
        db: SqlitePool,
        clock: SharedClock,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn RateLimitStore>,
    ) -> IdentityResult<Self> {
        let timeout = config.storage.timeout;

        let signer = Arc::new(TokenSigner::new(&config.authentication, clock.clone()));
        let sessions = Arc::new(SessionStore::new(
            db.clone(),
            signer,
            clock.clone(),
            config.authentication.max_sessions_per_account,
            timeout,
        ));

        let lockout = Arc::new(AccountLockout::new(
            db.clone(),
            LockoutPolicy::from_config(&config.lockout),
            clock.clone(),
            timeout,
        ));

        let rate_limiter = Arc::new(AuthRateLimiter::new(
            store,
            clock.clone(),
            config.rate_limit.enabled,
        ));
        let throttle = GlobalThrottle::new(config.rate_limit.global_requests_per_minute);

        let trial_engine = Arc::new(TrialEngine::new(
            db.clone(),
            TrialPolicy::from_config(&config.trial),
            notifier.clone(),
            clock.clone(),
            timeout,
        ));

        let account_manager = Arc::new(AccountManager::new(
            db.clone(),
            &config,
            clock.clone(),
            sessions.clone(),
            lockout.clone(),
            rate_limiter.clone(),
            notifier.clone(),
        )?);

        Ok(Self {
            config: Arc::new(config),
            db,
            clock,
            account_manager,
            sessions,
            lockout,
            rate_limiter,
            throttle,
            trial_engine,
            notifier,
        })
    }
}

use crate::{context::AppContext, error::IdentityResult, metrics};
use std::{future::Future, sync::Arc, time::Instant};
use tokio::time::{interval, Duration};
use tracing::{error, info};

pub mod tasks;

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        // Trial lifecycle
        tokio::spawn(Self::trial_lifecycle_job(Arc::clone(&self)));

        // Spawn cleanup tasks
        tokio::spawn(Self::expired_session_cleanup_job(Arc::clone(&self)));
        tokio::spawn(Self::reset_token_cleanup_job(Arc::clone(&self)));
        tokio::spawn(Self::rate_limit_sweep_job(Arc::clone(&self)));

        // Spawn monitoring tasks
        tokio::spawn(Self::health_check_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Trial reminders, then expiry (runs daily)
    async fn trial_lifecycle_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(86400)); // Every 24 hours

        loop {
            interval.tick().await;
            info!("Running trial lifecycle sweep");

            match timed("trial_reminders", tasks::send_trial_reminders(&scheduler.context)).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Sent {} trial reminders", count);
                    }
                }
                Err(e) => error!("Failed to send trial reminders: {}", e),
            }

            match timed("trial_expiry", tasks::expire_trials(&scheduler.context)).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Expired {} trials", count);
                    } else {
                        info!("Trial expiry: no trials due");
                    }
                }
                Err(e) => error!("Failed to expire trials: {}", e),
            }
        }
    }

    /// Cleanup expired refresh sessions (runs every hour)
    async fn expired_session_cleanup_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(3600)); // Every hour

        loop {
            interval.tick().await;
            info!("Running expired session cleanup");

            match timed("session_cleanup", tasks::cleanup_expired_sessions(&scheduler.context)).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Cleaned up {} expired refresh sessions", count);
                    } else {
                        info!("Session cleanup: no expired sessions found");
                    }
                }
                Err(e) => error!("Failed to cleanup expired sessions: {}", e),
            }
        }
    }

    /// Purge reset tokens past their expiry (runs every hour)
    async fn reset_token_cleanup_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(3600)); // Every hour

        loop {
            interval.tick().await;

            match timed("reset_token_cleanup", tasks::purge_reset_tokens(&scheduler.context)).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Purged {} expired reset tokens", count);
                    }
                }
                Err(e) => error!("Failed to purge reset tokens: {}", e),
            }
        }
    }

    /// Drop stale rate-limit entries (runs every 5 minutes)
    async fn rate_limit_sweep_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300)); // Every 5 minutes

        loop {
            interval.tick().await;

            match timed("rate_limit_sweep", tasks::sweep_rate_limits(&scheduler.context)).await {
                Ok(_) => {
                    // Silent success
                }
                Err(e) => error!("Failed to sweep rate limit entries: {}", e),
            }
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300)); // Every 5 minutes

        loop {
            interval.tick().await;

            match tasks::health_check(&scheduler.context).await {
                Ok(_) => {
                    // Silent success - health is good
                }
                Err(e) => error!("Health check failed: {}", e),
            }
        }
    }
}

/// Run one job pass and record its outcome and duration
async fn timed<T, F>(job_type: &str, job: F) -> IdentityResult<T>
where
    F: Future<Output = IdentityResult<T>>,
{
    let start = Instant::now();
    let result = job.await;
    let status = if result.is_ok() { "success" } else { "failure" };
    metrics::record_background_job(job_type, status, start.elapsed().as_secs_f64());
    result
}

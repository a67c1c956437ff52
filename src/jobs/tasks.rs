/// Background task implementations
use crate::{context::AppContext, db::bounded, error::IdentityResult};

/// Send ending-soon reminders for running trials
pub async fn send_trial_reminders(ctx: &AppContext) -> IdentityResult<usize> {
    ctx.trial_engine.send_reminders().await
}

/// Expire finished trials and downgrade their accounts
pub async fn expire_trials(ctx: &AppContext) -> IdentityResult<usize> {
    ctx.trial_engine.expire_trials().await
}

/// Cleanup expired refresh sessions
pub async fn cleanup_expired_sessions(ctx: &AppContext) -> IdentityResult<u64> {
    ctx.sessions.sweep_expired().await
}

/// Delete reset tokens that can no longer be redeemed
pub async fn purge_reset_tokens(ctx: &AppContext) -> IdentityResult<u64> {
    let now = ctx.clock.now();
    bounded(ctx.config.storage.timeout, "reset token purge", async {
        let result = sqlx::query("DELETE FROM password_reset_token WHERE expires_at <= ?1")
            .bind(now)
            .execute(&ctx.db)
            .await?;
        Ok(result.rows_affected())
    })
    .await
}

/// Drop stale rate-limit counters and idle throttle state
pub async fn sweep_rate_limits(ctx: &AppContext) -> IdentityResult<usize> {
    let removed = ctx.rate_limiter.sweep().await?;
    ctx.throttle.sweep();
    Ok(removed)
}

/// Health check - verify storage is answering
pub async fn health_check(ctx: &AppContext) -> IdentityResult<()> {
    bounded(ctx.config.storage.timeout, "health check", async {
        sqlx::query("SELECT 1").fetch_one(&ctx.db).await?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        config::ServerConfig,
        crypto::random_token,
        db::memory_pool,
        mailer::MemoryNotifier,
        rate_limit::{MemoryStore, Scope},
    };
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    async fn context() -> (AppContext, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::new());
        let ctx = AppContext::from_parts(
            ServerConfig::for_testing(),
            memory_pool().await.unwrap(),
            clock.clone(),
            Arc::new(MemoryNotifier::new()),
            store.clone(),
        )
        .unwrap();
        (ctx, clock, store)
    }

    #[tokio::test]
    async fn test_health_check() {
        let (ctx, _, _) = context().await;
        tokio_test::assert_ok!(health_check(&ctx).await);
    }

    #[tokio::test]
    async fn test_purge_reset_tokens_removes_expired_only() {
        let (ctx, clock, _) = context().await;
        let now = clock.now();
        sqlx::query(
            "INSERT INTO account (id, email, name, password_changed_at, created_at)
             VALUES ('acct-1', 'a@example.com', 'A', ?1, ?1)",
        )
        .bind(now)
        .execute(&ctx.db)
        .await
        .unwrap();

        for expires_at in [now - Duration::minutes(1), now + Duration::minutes(30)] {
            sqlx::query(
                "INSERT INTO password_reset_token (token_hash, account_id, created_at, expires_at)
                 VALUES (?1, 'acct-1', ?2, ?3)",
            )
            .bind(random_token())
            .bind(now)
            .bind(expires_at)
            .execute(&ctx.db)
            .await
            .unwrap();
        }

        assert_eq!(purge_reset_tokens(&ctx).await.unwrap(), 1);
        assert_eq!(purge_reset_tokens(&ctx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_rate_limits() {
        let (ctx, clock, store) = context().await;
        ctx.rate_limiter.check(Scope::LoginIp, "10.0.0.1").await.unwrap();
        assert_eq!(store.len(), 1);

        clock.advance(Duration::hours(1));
        assert_eq!(sweep_rate_limits(&ctx).await.unwrap(), 1);
        assert!(store.is_empty());
    }
}

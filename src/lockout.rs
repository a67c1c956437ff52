/// Durable per-account lockout
///
/// The decision logic is pure (`LockoutPolicy`); `AccountLockout` persists the
/// result on the account row with a compare-and-swap update so concurrent
/// failures cannot both slip under the threshold.
use crate::{
    clock::{to_chrono, SharedClock},
    config::LockoutConfig,
    db::{account::Account, bounded},
    error::{IdentityError, IdentityResult},
    metrics,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

const MAX_CAS_ATTEMPTS: usize = 16;

/// Failure counter and lock expiry as stored on the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockState {
    pub failed_count: u32,
    pub lock_until: Option<DateTime<Utc>>,
}

impl LockState {
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_until.map_or(false, |until| until > now)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub max_failed_attempts: u32,
    pub lock_duration: Duration,
}

impl LockoutPolicy {
    pub fn from_config(config: &LockoutConfig) -> Self {
        Self {
            max_failed_attempts: config.max_failed_attempts,
            lock_duration: to_chrono(config.lock_duration),
        }
    }

    /// An elapsed lock is forgotten together with its counter
    pub fn normalize(&self, state: LockState, now: DateTime<Utc>) -> LockState {
        match state.lock_until {
            Some(until) if until <= now => LockState::default(),
            _ => state,
        }
    }

    /// Err carries the remaining lock time in whole minutes, rounded up
    pub fn check(&self, state: LockState, now: DateTime<Utc>) -> Result<(), i64> {
        match state.lock_until {
            Some(until) if until > now => Err(remaining_minutes(until, now)),
            _ => Ok(()),
        }
    }

    /// State after one more failed password check
    pub fn after_failure(&self, state: LockState, now: DateTime<Utc>) -> LockState {
        let current = self.normalize(state, now);
        let failed_count = current.failed_count.saturating_add(1);

        let lock_until = if failed_count >= self.max_failed_attempts {
            Some(current.lock_until.unwrap_or(now + self.lock_duration))
        } else {
            current.lock_until
        };

        LockState {
            failed_count,
            lock_until,
        }
    }
}

pub fn remaining_minutes(until: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let secs = (until - now).num_seconds().max(0);
    ((secs + 59) / 60).max(1)
}

/// Persists lockout state on the account row
pub struct AccountLockout {
    db: SqlitePool,
    policy: LockoutPolicy,
    clock: SharedClock,
    timeout: std::time::Duration,
}

impl AccountLockout {
    pub fn new(
        db: SqlitePool,
        policy: LockoutPolicy,
        clock: SharedClock,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            db,
            policy,
            clock,
            timeout,
        }
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// Reject a locked account; lazily clear a lock that has run out
    pub async fn check(&self, account: &Account) -> IdentityResult<()> {
        let now = self.clock.now();
        let state = account.lock_state();

        if let Err(remaining_minutes) = self.policy.check(state, now) {
            debug!(account_id = %account.id, remaining_minutes, "Rejected login for locked account");
            return Err(IdentityError::Locked { remaining_minutes });
        }

        if let Some(until) = state.lock_until {
            // Only reached when the lock has elapsed
            bounded(self.timeout, "lockout expiry", async {
                sqlx::query(
                    "UPDATE account SET failed_login_count = 0, lock_until = NULL
                     WHERE id = ?1 AND lock_until = ?2",
                )
                .bind(&account.id)
                .bind(until)
                .execute(&self.db)
                .await?;
                Ok(())
            })
            .await?;
            debug!(account_id = %account.id, "Cleared expired account lock");
        }

        Ok(())
    }

    /// Count one failed password check and lock the account at the threshold
    pub async fn record_failure(&self, account_id: &str) -> IdentityResult<LockState> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now();
            let current = self.load(account_id).await?;
            let next = self.policy.after_failure(current, now);

            let updated = bounded(self.timeout, "lockout update", async {
                let result = sqlx::query(
                    "UPDATE account SET failed_login_count = ?1, lock_until = ?2
                     WHERE id = ?3 AND failed_login_count = ?4 AND lock_until IS ?5",
                )
                .bind(i64::from(next.failed_count))
                .bind(next.lock_until)
                .bind(account_id)
                .bind(i64::from(current.failed_count))
                .bind(current.lock_until)
                .execute(&self.db)
                .await?;
                Ok(result.rows_affected())
            })
            .await?;

            if updated == 1 {
                if next.is_locked(now) && !current.is_locked(now) {
                    warn!(
                        account_id,
                        failed_count = next.failed_count,
                        "Account locked after repeated failed logins"
                    );
                    metrics::record_lockout();
                }
                return Ok(next);
            }

            debug!(account_id, "Lockout update raced, retrying");
        }

        Err(IdentityError::Internal(
            "Lockout state kept changing underneath update".to_string(),
        ))
    }

    /// Successful authentication clears the counter and any elapsed lock.
    ///
    /// A lock that is still running was set by a concurrent failure after this
    /// login's check; it is kept and reported as `Locked`.
    pub async fn reset(&self, account_id: &str) -> IdentityResult<()> {
        let now = self.clock.now();
        let updated = bounded(self.timeout, "lockout reset", async {
            let result = sqlx::query(
                "UPDATE account SET failed_login_count = 0, lock_until = NULL
                 WHERE id = ?1 AND (lock_until IS NULL OR lock_until <= ?2)",
            )
            .bind(account_id)
            .bind(now)
            .execute(&self.db)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            let state = self.load(account_id).await?;
            if let Err(remaining_minutes) = self.policy.check(state, now) {
                debug!(account_id, "Account locked while login was in flight");
                return Err(IdentityError::Locked { remaining_minutes });
            }
        }

        Ok(())
    }

    async fn load(&self, account_id: &str) -> IdentityResult<LockState> {
        bounded(self.timeout, "lockout read", async {
            let row = sqlx::query("SELECT failed_login_count, lock_until FROM account WHERE id = ?1")
                .bind(account_id)
                .fetch_optional(&self.db)
                .await?
                .ok_or_else(|| IdentityError::NotFound("Account not found".to_string()))?;

            let failed: i64 = row.try_get("failed_login_count")?;
            Ok(LockState {
                failed_count: u32::try_from(failed).unwrap_or(0),
                lock_until: row.try_get("lock_until")?,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::memory_pool;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn policy() -> LockoutPolicy {
        LockoutPolicy {
            max_failed_attempts: 5,
            lock_duration: Duration::minutes(30),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_locks_exactly_at_threshold() {
        let policy = policy();
        let mut state = LockState::default();
        for _ in 0..4 {
            state = policy.after_failure(state, t0());
            assert!(policy.check(state, t0()).is_ok());
        }
        state = policy.after_failure(state, t0());
        assert_eq!(state.failed_count, 5);
        assert_eq!(policy.check(state, t0()), Err(30));
    }

    #[test]
    fn test_remaining_minutes_round_up() {
        let until = t0() + Duration::seconds(61);
        assert_eq!(remaining_minutes(until, t0()), 2);
        assert_eq!(remaining_minutes(t0() + Duration::seconds(1), t0()), 1);
    }

    #[test]
    fn test_elapsed_lock_resets_counter() {
        let policy = policy();
        let locked = LockState {
            failed_count: 5,
            lock_until: Some(t0()),
        };
        let later = t0() + Duration::seconds(1);
        assert!(policy.check(locked, later).is_ok());
        assert_eq!(policy.normalize(locked, later), LockState::default());
        assert_eq!(policy.after_failure(locked, later).failed_count, 1);
    }

    async fn seeded(pool: &SqlitePool) {
        sqlx::query(
            "INSERT INTO account (id, email, name, password_changed_at, created_at)
             VALUES ('acct-1', 'a@example.com', 'A', ?1, ?1)",
        )
        .bind(t0())
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_record_failure_persists_lock() {
        let pool = memory_pool().await.unwrap();
        seeded(&pool).await;
        let clock = Arc::new(ManualClock::new(t0()));
        let lockout = AccountLockout::new(
            pool.clone(),
            policy(),
            clock.clone(),
            std::time::Duration::from_secs(5),
        );

        for expected in 1..=5u32 {
            let state = lockout.record_failure("acct-1").await.unwrap();
            assert_eq!(state.failed_count, expected);
        }

        let state = lockout.load("acct-1").await.unwrap();
        assert_eq!(state.lock_until, Some(t0() + Duration::minutes(30)));

        clock.advance(Duration::minutes(31));
        lockout.reset("acct-1").await.unwrap();
        assert_eq!(lockout.load("acct-1").await.unwrap(), LockState::default());
    }

    #[tokio::test]
    async fn test_reset_keeps_a_running_lock() {
        let pool = memory_pool().await.unwrap();
        seeded(&pool).await;
        let clock = Arc::new(ManualClock::new(t0()));
        let lockout = AccountLockout::new(
            pool.clone(),
            policy(),
            clock.clone(),
            std::time::Duration::from_secs(5),
        );

        // Failures land between a login's lock check and its reset
        for _ in 0..5 {
            lockout.record_failure("acct-1").await.unwrap();
        }

        let result = lockout.reset("acct-1").await;
        assert!(matches!(result, Err(IdentityError::Locked { remaining_minutes: 30 })));

        let state = lockout.load("acct-1").await.unwrap();
        assert_eq!(state.failed_count, 5);
        assert_eq!(state.lock_until, Some(t0() + Duration::minutes(30)));
    }

    #[tokio::test]
    async fn test_reset_clears_counter_below_threshold() {
        let pool = memory_pool().await.unwrap();
        seeded(&pool).await;
        let clock = Arc::new(ManualClock::new(t0()));
        let lockout = AccountLockout::new(pool, policy(), clock, std::time::Duration::from_secs(5));

        lockout.record_failure("acct-1").await.unwrap();
        lockout.record_failure("acct-1").await.unwrap();
        lockout.reset("acct-1").await.unwrap();
        assert_eq!(lockout.load("acct-1").await.unwrap(), LockState::default());
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_all_counted() {
        let pool = memory_pool().await.unwrap();
        seeded(&pool).await;
        let clock = Arc::new(ManualClock::new(t0()));
        let lockout = Arc::new(AccountLockout::new(
            pool.clone(),
            LockoutPolicy {
                max_failed_attempts: 100,
                lock_duration: Duration::minutes(30),
            },
            clock,
            std::time::Duration::from_secs(5),
        ));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let lockout = lockout.clone();
                tokio::spawn(async move { lockout.record_failure("acct-1").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(lockout.load("acct-1").await.unwrap().failed_count, 6);
    }
}

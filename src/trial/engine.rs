/// Scheduler-driven trial sweeps
///
/// Each sweep selects candidates with SQL, re-checks them with the pure
/// predicates, then claims every transition with a conditional update before
/// notifying. A second run, or a concurrent one, finds nothing left to claim.
use super::{transition, TrialEvent, TrialPolicy};
use crate::{
    clock::SharedClock,
    db::{
        account::{join_roles, Account, Role, ACCOUNT_COLUMNS},
        bounded,
    },
    error::IdentityResult,
    mailer::Notifier,
    metrics,
};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

pub struct TrialEngine {
    db: SqlitePool,
    policy: TrialPolicy,
    notifier: Arc<dyn Notifier>,
    clock: SharedClock,
    timeout: Duration,
}

impl TrialEngine {
    pub fn new(
        db: SqlitePool,
        policy: TrialPolicy,
        notifier: Arc<dyn Notifier>,
        clock: SharedClock,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            policy,
            notifier,
            clock,
            timeout,
        }
    }

    pub fn policy(&self) -> &TrialPolicy {
        &self.policy
    }

    /// Send one reminder to every trial ending within the reminder lead.
    /// Returns the number of reminders sent.
    pub async fn send_reminders(&self) -> IdentityResult<usize> {
        let now = self.clock.now();
        let horizon = now + self.policy.reminder_lead;

        let candidates = bounded(self.timeout, "reminder candidates", async {
            let accounts = sqlx::query_as::<_, Account>(&format!(
                "SELECT {} FROM account
                 WHERE trial_expired = 0 AND trial_reminder_sent = 0
                   AND trial_end IS NOT NULL AND trial_end >= ?1 AND trial_end <= ?2",
                ACCOUNT_COLUMNS
            ))
            .bind(now)
            .bind(horizon)
            .fetch_all(&self.db)
            .await?;
            Ok(accounts)
        })
        .await?;

        let mut sent = 0;
        for account in candidates {
            let Some(trial) = account.trial else { continue };
            if !trial.reminder_due(now, self.policy.reminder_lead) {
                continue;
            }
            let next = match transition(Some(&trial), TrialEvent::Remind, now, &self.policy) {
                Ok(next) => next,
                Err(e) => {
                    warn!(account_id = %account.id, "Skipping reminder: {}", e);
                    continue;
                }
            };

            let claimed = bounded(self.timeout, "reminder claim", async {
                let result = sqlx::query(
                    "UPDATE account SET trial_reminder_sent = 1
                     WHERE id = ?1 AND trial_reminder_sent = 0 AND trial_expired = 0",
                )
                .bind(&account.id)
                .execute(&self.db)
                .await?;
                Ok(result.rows_affected() == 1)
            })
            .await?;
            if !claimed {
                continue;
            }

            metrics::record_trial_transition("reminder_sent");
            if let Err(e) = self
                .notifier
                .trial_reminder(&account.email, &account.name, next.end)
                .await
            {
                warn!(account_id = %account.id, "Trial reminder delivery failed: {}", e);
            }
            sent += 1;
        }

        if sent > 0 {
            info!("Sent {} trial reminders", sent);
        }
        Ok(sent)
    }

    /// Expire finished trials not covered by a paid plan and downgrade the
    /// account. Returns the number of accounts downgraded.
    pub async fn expire_trials(&self) -> IdentityResult<usize> {
        let now = self.clock.now();

        let candidates = bounded(self.timeout, "expiry candidates", async {
            let accounts = sqlx::query_as::<_, Account>(&format!(
                "SELECT {} FROM account
                 WHERE trial_expired = 0 AND trial_end IS NOT NULL AND trial_end <= ?1",
                ACCOUNT_COLUMNS
            ))
            .bind(now)
            .fetch_all(&self.db)
            .await?;
            Ok(accounts)
        })
        .await?;

        let mut expired = 0;
        for account in candidates {
            let Some(trial) = account.trial else { continue };
            if !trial.expiry_due(now, account.subscription.is_active(now)) {
                continue;
            }
            let next = match transition(Some(&trial), TrialEvent::Expire, now, &self.policy) {
                Ok(next) => next,
                Err(e) => {
                    warn!(account_id = %account.id, "Skipping expiry: {}", e);
                    continue;
                }
            };

            let roles = downgraded_roles(&account);
            let claimed = bounded(self.timeout, "expiry claim", async {
                let result = sqlx::query(
                    "UPDATE account SET
                        trial_expired = 1,
                        trial_listings_quota = ?2,
                        role = ?3,
                        available_roles = ?4,
                        active_role = ?5,
                        primary_role = ?6,
                        listings_quota = ?7,
                        is_subscribed = 0,
                        subscription_plan = NULL,
                        subscription_expires_at = NULL
                     WHERE id = ?1 AND trial_expired = 0",
                )
                .bind(&account.id)
                .bind(next.listings_quota)
                .bind(roles.role.as_str())
                .bind(join_roles(&roles.available))
                .bind(roles.active.map(|r| r.as_str()))
                .bind(roles.primary.map(|r| r.as_str()))
                .bind(self.policy.free_listings_quota)
                .execute(&self.db)
                .await?;
                Ok(result.rows_affected() == 1)
            })
            .await?;
            if !claimed {
                continue;
            }

            info!(account_id = %account.id, "Trial expired, account downgraded to {}", roles.role);
            metrics::record_trial_transition("expired");
            if let Err(e) = self.notifier.trial_expired(&account.email, &account.name).await {
                warn!(account_id = %account.id, "Trial expiry delivery failed: {}", e);
            }
            expired += 1;
        }

        if expired > 0 {
            info!("Expired {} trials", expired);
        }
        Ok(expired)
    }
}

struct RoleSet {
    role: Role,
    available: Vec<Role>,
    active: Option<Role>,
    primary: Option<Role>,
}

/// Every mention of the trial role becomes the downgrade tier
fn downgraded_roles(account: &Account) -> RoleSet {
    let demote = |role: Role| {
        if role.is_trial_eligible() {
            Role::PrivateSeller
        } else {
            role
        }
    };

    let mut available: Vec<Role> = Vec::new();
    for role in account.available_roles.iter().copied().map(demote) {
        if !available.contains(&role) {
            available.push(role);
        }
    }

    RoleSet {
        role: demote(account.role),
        available,
        active: account.active_role.map(demote),
        primary: account.primary_role.map(demote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::memory_pool;
    use crate::mailer::{MemoryNotifier, Notification};
    use crate::trial::Trial;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use sqlx::Row;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
    }

    fn policy() -> TrialPolicy {
        TrialPolicy {
            duration: Duration::days(7),
            reminder_lead: Duration::days(3),
            listings_quota: 10,
            free_listings_quota: 3,
        }
    }

    async fn insert_agent(pool: &SqlitePool, id: &str, trial: Trial) {
        sqlx::query(
            "INSERT INTO account (id, email, name, role, available_roles, active_role, primary_role,
                                  password_changed_at, listings_quota, trial_start, trial_end,
                                  trial_reminder_sent, trial_expired, trial_listings_quota, created_at)
             VALUES (?1, ?2, 'Agent', 'agent', 'buyer,agent', 'agent', 'agent',
                     ?3, ?4, ?5, ?6, ?7, ?8, ?4, ?3)",
        )
        .bind(id)
        .bind(format!("{}@example.com", id))
        .bind(trial.start)
        .bind(trial.listings_quota)
        .bind(trial.start)
        .bind(trial.end)
        .bind(trial.reminder_sent)
        .bind(trial.expired)
        .execute(pool)
        .await
        .unwrap();
    }

    fn engine(pool: &SqlitePool) -> (TrialEngine, Arc<ManualClock>, Arc<MemoryNotifier>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let notifier = Arc::new(MemoryNotifier::new());
        (
            TrialEngine::new(
                pool.clone(),
                policy(),
                notifier.clone(),
                clock.clone(),
                std::time::Duration::from_secs(5),
            ),
            clock,
            notifier,
        )
    }

    #[tokio::test]
    async fn test_reminder_sweep_is_idempotent() {
        let pool = memory_pool().await.unwrap();
        insert_agent(&pool, "agent-1", Trial::begin(t0(), &policy())).await;
        let (engine, clock, notifier) = engine(&pool);

        // Too early
        clock.advance(Duration::days(2));
        assert_eq!(engine.send_reminders().await.unwrap(), 0);

        clock.advance(Duration::days(2));
        assert_eq!(engine.send_reminders().await.unwrap(), 1);
        assert_eq!(engine.send_reminders().await.unwrap(), 0);

        let reminders = notifier
            .sent()
            .into_iter()
            .filter(|n| matches!(n, Notification::TrialReminder { .. }))
            .count();
        assert_eq!(reminders, 1);

        let role: String = sqlx::query_scalar("SELECT role FROM account WHERE id = 'agent-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(role, "agent");
    }

    #[tokio::test]
    async fn test_expiry_downgrades_once() {
        let pool = memory_pool().await.unwrap();
        insert_agent(&pool, "agent-1", Trial::begin(t0(), &policy())).await;
        let (engine, clock, notifier) = engine(&pool);

        clock.advance(Duration::days(8));
        assert_eq!(engine.expire_trials().await.unwrap(), 1);
        assert_eq!(engine.expire_trials().await.unwrap(), 0);

        let row = sqlx::query(
            "SELECT role, available_roles, active_role, listings_quota, trial_expired, is_subscribed
             FROM account WHERE id = 'agent-1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row.get::<String, _>("role"), "private_seller");
        assert_eq!(row.get::<String, _>("available_roles"), "buyer,private_seller");
        assert_eq!(row.get::<String, _>("active_role"), "private_seller");
        assert_eq!(row.get::<i64, _>("listings_quota"), 3);
        assert!(row.get::<bool, _>("trial_expired"));
        assert!(!row.get::<bool, _>("is_subscribed"));

        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_active_subscription_blocks_expiry() {
        let pool = memory_pool().await.unwrap();
        insert_agent(&pool, "agent-1", Trial::begin(t0(), &policy())).await;
        sqlx::query(
            "UPDATE account SET is_subscribed = 1, subscription_plan = 'pro', subscription_expires_at = ?1",
        )
        .bind(t0() + Duration::days(60))
        .execute(&pool)
        .await
        .unwrap();
        let (engine, clock, _) = engine(&pool);

        clock.advance(Duration::days(8));
        assert_eq!(engine.expire_trials().await.unwrap(), 0);

        // Once the plan lapses the trial expiry goes through
        clock.advance(Duration::days(60));
        assert_eq!(engine.expire_trials().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_notify_once() {
        let pool = memory_pool().await.unwrap();
        insert_agent(&pool, "agent-1", Trial::begin(t0(), &policy())).await;
        insert_agent(&pool, "agent-2", Trial::begin(t0(), &policy())).await;
        let (engine, clock, notifier) = engine(&pool);
        let engine = Arc::new(engine);

        clock.advance(Duration::days(9));
        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.expire_trials().await.unwrap() }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.expire_trials().await.unwrap() }
        });

        let total = a.await.unwrap() + b.await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_sweeps_fail_closed_when_storage_stalls() {
        let pool = memory_pool().await.unwrap();
        let engine = TrialEngine::new(
            pool.clone(),
            policy(),
            Arc::new(MemoryNotifier::new()),
            Arc::new(ManualClock::new(t0())),
            std::time::Duration::from_millis(50),
        );

        // Holding the only connection stalls every query
        let tx = pool.begin().await.unwrap();
        assert!(matches!(
            engine.send_reminders().await,
            Err(crate::error::IdentityError::Unavailable(_))
        ));
        assert!(matches!(
            engine.expire_trials().await,
            Err(crate::error::IdentityError::Unavailable(_))
        ));
        drop(tx);

        assert_eq!(engine.expire_trials().await.unwrap(), 0);
    }
}

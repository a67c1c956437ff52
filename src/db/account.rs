/// Account database models
use crate::{lockout::LockState, trial::Trial};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::fmt;
use std::str::FromStr;

/// Account roles. `Agent` is trial-eligible; `PrivateSeller` is the tier a lapsed trial falls back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Buyer,
    PrivateSeller,
    Agent,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Buyer => "buyer",
            Role::PrivateSeller => "private_seller",
            Role::Agent => "agent",
            Role::Admin => "admin",
        }
    }

    pub fn is_trial_eligible(&self) -> bool {
        matches!(self, Role::Agent)
    }

    /// Roles a user may pick for themselves
    pub fn is_self_selectable(&self) -> bool {
        !matches!(self, Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "buyer" => Ok(Role::Buyer),
            "private_seller" => Ok(Role::PrivateSeller),
            "agent" => Ok(Role::Agent),
            "admin" => Ok(Role::Admin),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

/// Serialize a role list for the `available_roles` column
pub fn join_roles(roles: &[Role]) -> String {
    roles.iter().map(Role::as_str).collect::<Vec<_>>().join(",")
}

fn split_roles(raw: &str) -> Result<Vec<Role>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Role::from_str)
        .collect()
}

/// Paid plan state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subscription {
    pub is_subscribed: bool,
    pub plan: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// A subscription with no end date stays active
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.is_subscribed && self.expires_at.map_or(true, |end| end > now)
    }
}

/// Account record in the database
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub phone: Option<String>,
    pub name: String,
    /// None for federated-only accounts
    pub password_hash: Option<String>,
    pub role: Role,
    pub available_roles: Vec<Role>,
    pub active_role: Option<Role>,
    pub primary_role: Option<Role>,
    pub failed_login_count: u32,
    pub lock_until: Option<DateTime<Utc>>,
    pub password_changed_at: DateTime<Utc>,
    pub listings_quota: i64,
    pub subscription: Subscription,
    pub trial: Option<Trial>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn lock_state(&self) -> LockState {
        LockState {
            failed_count: self.failed_login_count,
            lock_until: self.lock_until,
        }
    }
}

fn decode_err(column: &str, message: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into(),
    }
}

fn optional_role(row: &SqliteRow, column: &str) -> Result<Option<Role>, sqlx::Error> {
    row.try_get::<Option<String>, _>(column)?
        .map(|s| Role::from_str(&s).map_err(|e| decode_err(column, e)))
        .transpose()
}

impl<'r> FromRow<'r, SqliteRow> for Account {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let role: String = row.try_get("role")?;
        let available: String = row.try_get("available_roles")?;
        let failed: i64 = row.try_get("failed_login_count")?;

        let trial = match (
            row.try_get::<Option<DateTime<Utc>>, _>("trial_start")?,
            row.try_get::<Option<DateTime<Utc>>, _>("trial_end")?,
        ) {
            (Some(start), Some(end)) => Some(Trial {
                start,
                end,
                reminder_sent: row.try_get("trial_reminder_sent")?,
                expired: row.try_get("trial_expired")?,
                listings_quota: row
                    .try_get::<Option<i64>, _>("trial_listings_quota")?
                    .unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Account {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            name: row.try_get("name")?,
            password_hash: row.try_get("password_hash")?,
            role: Role::from_str(&role).map_err(|e| decode_err("role", e))?,
            available_roles: split_roles(&available)
                .map_err(|e| decode_err("available_roles", e))?,
            active_role: optional_role(row, "active_role")?,
            primary_role: optional_role(row, "primary_role")?,
            failed_login_count: u32::try_from(failed).unwrap_or(0),
            lock_until: row.try_get("lock_until")?,
            password_changed_at: row.try_get("password_changed_at")?,
            listings_quota: row.try_get("listings_quota")?,
            subscription: Subscription {
                is_subscribed: row.try_get("is_subscribed")?,
                plan: row.try_get("subscription_plan")?,
                expires_at: row.try_get("subscription_expires_at")?,
            },
            trial,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Column list matching `Account::from_row`
pub const ACCOUNT_COLUMNS: &str = "id, email, phone, name, password_hash, role, available_roles, \
     active_role, primary_role, failed_login_count, lock_until, password_changed_at, \
     listings_quota, is_subscribed, subscription_plan, subscription_expires_at, \
     trial_start, trial_end, trial_reminder_sent, trial_expired, trial_listings_quota, created_at";

/// One login attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginHistoryEntry {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub failure_reason: Option<String>,
}

impl<'r> FromRow<'r, SqliteRow> for LoginHistoryEntry {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            at: row.try_get("at")?,
            success: row.try_get("success")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            failure_reason: row.try_get("failure_reason")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_role_round_trip_and_rejects_unknown() {
        for role in [Role::Buyer, Role::PrivateSeller, Role::Agent, Role::Admin] {
            assert_eq!(Role::from_str(role.as_str()).unwrap(), role);
        }
        assert!(Role::from_str("landlord").is_err());
    }

    #[test]
    fn test_role_list_column() {
        let joined = join_roles(&[Role::Buyer, Role::Agent]);
        assert_eq!(joined, "buyer,agent");
        assert_eq!(split_roles(&joined).unwrap(), vec![Role::Buyer, Role::Agent]);
        assert!(split_roles("").unwrap().is_empty());
    }

    #[test]
    fn test_subscription_activity() {
        let now = Utc::now();
        let open_ended = Subscription {
            is_subscribed: true,
            plan: Some("pro".into()),
            expires_at: None,
        };
        assert!(open_ended.is_active(now));

        let lapsed = Subscription {
            expires_at: Some(now - Duration::days(1)),
            ..open_ended.clone()
        };
        assert!(!lapsed.is_active(now));
        assert!(!Subscription::default().is_active(now));
    }
}

/// Trial entitlement lifecycle
///
/// `Trial` is the value object embedded in an account. Its transitions are
/// pure functions of (current trial, event, now, policy); `TrialEngine` in
/// `engine` selects candidates and applies them against storage.
///
/// States: NoTrial -> Active -> ReminderSent -> Expired. Re-adopting the
/// trial role from NoTrial or Expired starts a fresh trial; nothing renews one.

pub mod engine;

pub use engine::TrialEngine;

use crate::{clock::to_chrono, config::TrialConfig};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trial {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub reminder_sent: bool,
    pub expired: bool,
    pub listings_quota: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    NoTrial,
    Active,
    ReminderSent,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialEvent {
    /// Account took on the trial-eligible role
    Adopt,
    /// Scheduler sent the ending-soon reminder
    Remind,
    /// Scheduler found the trial over with no paid plan
    Expire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Trial cannot move from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: TrialState,
    pub event: TrialEvent,
}

#[derive(Debug, Clone, Copy)]
pub struct TrialPolicy {
    pub duration: Duration,
    pub reminder_lead: Duration,
    pub listings_quota: i64,
    pub free_listings_quota: i64,
}

impl TrialPolicy {
    pub fn from_config(config: &TrialConfig) -> Self {
        Self {
            duration: to_chrono(config.duration),
            reminder_lead: to_chrono(config.reminder_lead),
            listings_quota: config.listings_quota,
            free_listings_quota: config.free_listings_quota,
        }
    }
}

impl Trial {
    pub fn begin(now: DateTime<Utc>, policy: &TrialPolicy) -> Self {
        Self {
            start: now,
            end: now + policy.duration,
            reminder_sent: false,
            expired: false,
            listings_quota: policy.listings_quota,
        }
    }

    pub fn state(&self) -> TrialState {
        if self.expired {
            TrialState::Expired
        } else if self.reminder_sent {
            TrialState::ReminderSent
        } else {
            TrialState::Active
        }
    }

    /// Not yet reminded, not expired, and ending within `lead` from now
    pub fn reminder_due(&self, now: DateTime<Utc>, lead: Duration) -> bool {
        !self.expired && !self.reminder_sent && self.end >= now && self.end <= now + lead
    }

    /// Over, not yet marked expired, and not covered by a paid plan
    pub fn expiry_due(&self, now: DateTime<Utc>, has_active_subscription: bool) -> bool {
        !self.expired && self.end <= now && !has_active_subscription
    }
}

pub fn state_of(trial: Option<&Trial>) -> TrialState {
    trial.map_or(TrialState::NoTrial, Trial::state)
}

/// Apply `event` to the current trial. The start/end window is never altered
/// except by a fresh adoption; the flags only move from false to true.
pub fn transition(
    current: Option<&Trial>,
    event: TrialEvent,
    now: DateTime<Utc>,
    policy: &TrialPolicy,
) -> Result<Trial, InvalidTransition> {
    let from = state_of(current);
    let invalid = InvalidTransition { from, event };

    match (event, current) {
        (TrialEvent::Adopt, None) => Ok(Trial::begin(now, policy)),
        (TrialEvent::Adopt, Some(trial)) if trial.expired => Ok(Trial::begin(now, policy)),
        (TrialEvent::Remind, Some(trial)) if from == TrialState::Active => Ok(Trial {
            reminder_sent: true,
            ..*trial
        }),
        (TrialEvent::Expire, Some(trial))
            if matches!(from, TrialState::Active | TrialState::ReminderSent) =>
        {
            Ok(Trial {
                expired: true,
                listings_quota: policy.free_listings_quota,
                ..*trial
            })
        }
        _ => Err(invalid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> TrialPolicy {
        TrialPolicy {
            duration: Duration::days(7),
            reminder_lead: Duration::days(3),
            listings_quota: 10,
            free_listings_quota: 3,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_adopt_starts_seven_day_trial() {
        let trial = transition(None, TrialEvent::Adopt, t0(), &policy()).unwrap();
        assert_eq!(trial.start, t0());
        assert_eq!(trial.end, t0() + Duration::days(7));
        assert_eq!(trial.listings_quota, 10);
        assert_eq!(trial.state(), TrialState::Active);
    }

    #[test]
    fn test_full_lifecycle() {
        let p = policy();
        let active = transition(None, TrialEvent::Adopt, t0(), &p).unwrap();
        let reminded = transition(Some(&active), TrialEvent::Remind, t0() + Duration::days(4), &p).unwrap();
        assert_eq!(reminded.state(), TrialState::ReminderSent);
        assert_eq!(reminded.end, active.end);

        let expired = transition(Some(&reminded), TrialEvent::Expire, t0() + Duration::days(8), &p).unwrap();
        assert_eq!(expired.state(), TrialState::Expired);
        assert_eq!(expired.listings_quota, 3);
        assert!(expired.reminder_sent);
    }

    #[test]
    fn test_active_can_expire_without_reminder() {
        let p = policy();
        let active = Trial::begin(t0(), &p);
        let expired = transition(Some(&active), TrialEvent::Expire, t0() + Duration::days(8), &p).unwrap();
        assert!(expired.expired);
        assert!(!expired.reminder_sent);
    }

    #[test]
    fn test_invalid_transitions() {
        let p = policy();
        let active = Trial::begin(t0(), &p);
        let reminded = Trial {
            reminder_sent: true,
            ..active
        };
        let expired = Trial {
            expired: true,
            ..reminded
        };

        assert!(transition(None, TrialEvent::Remind, t0(), &p).is_err());
        assert!(transition(None, TrialEvent::Expire, t0(), &p).is_err());
        assert!(transition(Some(&active), TrialEvent::Adopt, t0(), &p).is_err());
        assert!(transition(Some(&reminded), TrialEvent::Remind, t0(), &p).is_err());
        assert!(transition(Some(&expired), TrialEvent::Expire, t0(), &p).is_err());
        assert!(transition(Some(&expired), TrialEvent::Remind, t0(), &p).is_err());
    }

    #[test]
    fn test_readoption_after_expiry_is_fresh() {
        let p = policy();
        let expired = Trial {
            expired: true,
            reminder_sent: true,
            ..Trial::begin(t0(), &p)
        };
        let later = t0() + Duration::days(30);
        let fresh = transition(Some(&expired), TrialEvent::Adopt, later, &p).unwrap();
        assert_eq!(fresh.start, later);
        assert_eq!(fresh.state(), TrialState::Active);
        assert!(!fresh.reminder_sent);
    }

    #[test]
    fn test_reminder_window() {
        let trial = Trial::begin(t0(), &policy());
        let lead = Duration::days(3);

        assert!(!trial.reminder_due(t0() + Duration::days(3), lead));
        assert!(trial.reminder_due(t0() + Duration::days(4), lead));
        assert!(trial.reminder_due(t0() + Duration::days(7), lead));
        assert!(!trial.reminder_due(t0() + Duration::days(7) + Duration::seconds(1), lead));

        let reminded = Trial {
            reminder_sent: true,
            ..trial
        };
        assert!(!reminded.reminder_due(t0() + Duration::days(5), lead));
    }

    #[test]
    fn test_expiry_respects_paid_plan() {
        let trial = Trial::begin(t0(), &policy());
        let after = t0() + Duration::days(8);

        assert!(!trial.expiry_due(t0() + Duration::days(6), false));
        assert!(trial.expiry_due(after, false));
        assert!(!trial.expiry_due(after, true));
    }
}

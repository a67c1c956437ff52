/// Counter storage for the authentication rate limiter
use crate::error::IdentityResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// One key's counter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateEntry {
    pub count: u32,
    pub window_reset: DateTime<Utc>,
    pub block_until: Option<DateTime<Utc>>,
}

impl RateEntry {
    fn fresh(window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_reset: now + window,
            block_until: None,
        }
    }

    /// Both the window and any block have run out
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.window_reset <= now && self.block_until.map_or(true, |until| until <= now)
    }
}

/// Backing store for rate-limit counters.
///
/// `increment` must be atomic per key: concurrent calls never lose a count.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Current state of `key`, with times relative to `now`
    async fn get(&self, key: &str, now: DateTime<Utc>) -> IdentityResult<Option<RateEntry>>;

    /// Count one attempt, starting a new window first if the current one has elapsed
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> IdentityResult<RateEntry>;

    async fn block(&self, key: &str, until: DateTime<Utc>, now: DateTime<Utc>) -> IdentityResult<()>;

    async fn delete(&self, key: &str) -> IdentityResult<()>;

    /// Drop stale entries, returning how many were removed
    async fn sweep(&self, now: DateTime<Utc>) -> IdentityResult<usize>;
}

/// Process-local store. Entry updates hold the shard lock for the key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, RateEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get(&self, key: &str, _now: DateTime<Utc>) -> IdentityResult<Option<RateEntry>> {
        Ok(self.entries.get(key).map(|e| *e))
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> IdentityResult<RateEntry> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateEntry::fresh(window, now));

        if entry.window_reset <= now {
            entry.count = 0;
            entry.window_reset = now + window;
        }
        if entry.block_until.map_or(false, |until| until <= now) {
            entry.block_until = None;
        }
        entry.count = entry.count.saturating_add(1);

        Ok(*entry)
    }

    async fn block(&self, key: &str, until: DateTime<Utc>, now: DateTime<Utc>) -> IdentityResult<()> {
        self.entries
            .entry(key.to_string())
            .and_modify(|e| e.block_until = Some(until))
            .or_insert_with(|| RateEntry {
                block_until: Some(until),
                ..RateEntry::fresh(Duration::zero(), now)
            });
        Ok(())
    }

    async fn delete(&self, key: &str) -> IdentityResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> IdentityResult<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}

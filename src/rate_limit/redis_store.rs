/// Redis-backed rate-limit counters
///
/// Lets several service instances share one view of attempt counts. Window
/// and block expiry ride on Redis key TTLs, so `sweep` has nothing to do.
use super::store::{RateEntry, RateLimitStore};
use crate::error::{IdentityError, IdentityResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{error, info};

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to `redis_url` (e.g. "redis://localhost:6379")
    pub async fn connect(redis_url: &str) -> IdentityResult<Self> {
        let client = Client::open(redis_url).map_err(store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;
        info!("Rate limiter using Redis store at {}", redis_url);

        Ok(Self {
            conn,
            key_prefix: "homestead:ratelimit:".to_string(),
        })
    }

    fn count_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn block_key(&self, key: &str) -> String {
        format!("{}{}:block", self.key_prefix, key)
    }
}

/// Redis failures surface as unavailability so callers deny rather than allow
fn store_error(e: redis::RedisError) -> IdentityError {
    error!("Rate limit store error: {}", e);
    IdentityError::Unavailable(format!("Rate limit store: {}", e))
}

/// PTTL answers -2 for a missing key and -1 for one without expiry
fn from_ttl(now: DateTime<Utc>, ttl_ms: i64) -> DateTime<Utc> {
    now + Duration::milliseconds(ttl_ms.max(0))
}

fn block_from(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

/// Build an entry from the counter, its PTTL and the block timestamp
fn decode_entry(
    count: Option<u32>,
    ttl_ms: i64,
    block: Option<i64>,
    now: DateTime<Utc>,
) -> Option<RateEntry> {
    let block_until = block_from(block);
    if count.is_none() && block_until.is_none() {
        return None;
    }

    Some(RateEntry {
        count: count.unwrap_or(0),
        window_reset: from_ttl(now, ttl_ms),
        block_until,
    })
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> IdentityResult<Option<RateEntry>> {
        let mut conn = self.conn.clone();
        let count_key = self.count_key(key);

        let (count, ttl_ms, block): (Option<u32>, i64, Option<i64>) = redis::pipe()
            .get(&count_key)
            .cmd("PTTL")
            .arg(&count_key)
            .get(self.block_key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        Ok(decode_entry(count, ttl_ms, block, now))
    }

    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> IdentityResult<RateEntry> {
        let mut conn = self.conn.clone();
        let count_key = self.count_key(key);
        let window_ms = window.num_milliseconds().max(1);

        // SET NX starts a window only when none is running; the key's TTL is the window
        let (count, ttl_ms, block): (u32, i64, Option<i64>) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&count_key)
            .arg(0)
            .arg("PX")
            .arg(window_ms)
            .arg("NX")
            .ignore()
            .cmd("INCR")
            .arg(&count_key)
            .cmd("PTTL")
            .arg(&count_key)
            .get(self.block_key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        Ok(RateEntry {
            count,
            window_reset: from_ttl(now, ttl_ms),
            block_until: block_from(block).filter(|until| *until > now),
        })
    }

    async fn block(&self, key: &str, until: DateTime<Utc>, now: DateTime<Utc>) -> IdentityResult<()> {
        let mut conn = self.conn.clone();
        let ttl_ms = (until - now).num_milliseconds().max(1);

        let _: () = redis::cmd("SET")
            .arg(self.block_key(key))
            .arg(until.timestamp())
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> IdentityResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.count_key(key))
            .arg(self.block_key(key))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn sweep(&self, _now: DateTime<Utc>) -> IdentityResult<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_missing_keys_decode_to_none() {
        assert_eq!(decode_entry(None, -2, None, t0()), None);
    }

    #[test]
    fn test_window_reset_follows_the_given_clock() {
        let entry = decode_entry(Some(4), 90_000, None, t0()).unwrap();
        assert_eq!(entry.count, 4);
        assert_eq!(entry.window_reset, t0() + Duration::seconds(90));
        assert_eq!(entry.block_until, None);

        // A clock far from wall time still anchors the window
        let past = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        let entry = decode_entry(Some(4), 90_000, None, past).unwrap();
        assert_eq!(entry.window_reset, past + Duration::seconds(90));
    }

    #[test]
    fn test_block_without_counter_is_kept() {
        let until = t0() + Duration::hours(1);
        let entry = decode_entry(None, -2, Some(until.timestamp()), t0()).unwrap();
        assert_eq!(entry.count, 0);
        assert_eq!(entry.window_reset, t0());
        assert_eq!(entry.block_until, Some(until));
        assert!(!entry.is_stale(t0()));
        assert!(entry.is_stale(until));
    }

    #[test]
    fn test_key_without_expiry_has_elapsed_window() {
        let entry = decode_entry(Some(2), -1, None, t0()).unwrap();
        assert_eq!(entry.window_reset, t0());
        assert!(entry.is_stale(t0()));
    }

    #[test]
    fn test_out_of_range_block_timestamp_is_ignored() {
        assert_eq!(block_from(Some(i64::MAX)), None);
        assert_eq!(decode_entry(None, -2, Some(i64::MAX), t0()), None);
    }
}

/// Rate limiting for authentication endpoints
///
/// Fixed-window attempt counters per (scope, key) with a longer block once a
/// window overflows. Counters live behind `RateLimitStore`; the global
/// per-IP request throttle lives in `throttle`.

pub mod redis_store;
pub mod store;
pub mod throttle;

pub use redis_store::RedisStore;
pub use store::{MemoryStore, RateEntry, RateLimitStore};
pub use throttle::{throttle_middleware, GlobalThrottle};

use crate::{
    clock::SharedClock,
    error::{IdentityError, IdentityResult},
    metrics,
};
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Endpoint class crossed with key type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    LoginIp,
    LoginAccount,
    SignupIp,
    ResetIp,
    ResetAccount,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::LoginIp,
        Scope::LoginAccount,
        Scope::SignupIp,
        Scope::ResetIp,
        Scope::ResetAccount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::LoginIp => "login:ip",
            Scope::LoginAccount => "login:account",
            Scope::SignupIp => "signup:ip",
            Scope::ResetIp => "reset:ip",
            Scope::ResetAccount => "reset:account",
        }
    }

    pub fn default_policy(&self) -> RatePolicy {
        match self {
            Scope::LoginIp => RatePolicy::new(5, Duration::minutes(15), Duration::minutes(30)),
            Scope::LoginAccount => RatePolicy::new(3, Duration::minutes(15), Duration::minutes(60)),
            Scope::SignupIp => RatePolicy::new(3, Duration::hours(1), Duration::hours(2)),
            Scope::ResetIp => RatePolicy::new(5, Duration::hours(1), Duration::hours(1)),
            Scope::ResetAccount => RatePolicy::new(3, Duration::hours(1), Duration::hours(2)),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.as_str(), key.trim().to_lowercase())
    }
}

/// Attempts allowed per window, and how long to block once exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub max_attempts: u32,
    pub window: Duration,
    pub block: Duration,
}

impl RatePolicy {
    pub fn new(max_attempts: u32, window: Duration, block: Duration) -> Self {
        Self {
            max_attempts,
            window,
            block,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_secs: Option<u64>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
        }
    }

    fn deny(until: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let secs = (until - now).num_seconds().max(1);
        Self {
            allowed: false,
            retry_after_secs: Some(u64::try_from(secs).unwrap_or(1)),
        }
    }

    pub fn into_result(self) -> IdentityResult<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(IdentityError::RateLimited {
                retry_after_secs: self.retry_after_secs.unwrap_or(1),
            })
        }
    }
}

/// Attempt limiter for login, signup and password reset
pub struct AuthRateLimiter {
    store: Arc<dyn RateLimitStore>,
    policies: HashMap<Scope, RatePolicy>,
    clock: SharedClock,
    enabled: bool,
}

impl AuthRateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, clock: SharedClock, enabled: bool) -> Self {
        Self {
            store,
            policies: Scope::ALL.iter().map(|s| (*s, s.default_policy())).collect(),
            clock,
            enabled,
        }
    }

    pub fn with_policy(mut self, scope: Scope, policy: RatePolicy) -> Self {
        self.policies.insert(scope, policy);
        self
    }

    pub fn policy(&self, scope: Scope) -> RatePolicy {
        self.policies
            .get(&scope)
            .copied()
            .unwrap_or_else(|| scope.default_policy())
    }

    /// Count one attempt under `key` and decide whether it may proceed
    pub async fn check(&self, scope: Scope, key: &str) -> IdentityResult<RateDecision> {
        if !self.enabled {
            return Ok(RateDecision::allow());
        }

        let now = self.clock.now();
        let policy = self.policy(scope);
        let key = scope.key(key);

        if let Some(until) = self.store.get(&key, now).await?.and_then(|e| e.block_until) {
            if until > now {
                debug!(key = %key, "Attempt rejected while blocked");
                metrics::record_rate_limited(scope.as_str());
                return Ok(RateDecision::deny(until, now));
            }
            // Block served; start over
            self.store.delete(&key).await?;
        }

        let entry = self.store.increment(&key, policy.window, now).await?;
        if entry.count > policy.max_attempts {
            let until = now + policy.block;
            self.store.block(&key, until, now).await?;
            warn!(
                key = %key,
                attempts = entry.count,
                "Rate limit exceeded, blocking for {} minutes",
                policy.block.num_minutes()
            );
            metrics::record_rate_limited(scope.as_str());
            return Ok(RateDecision::deny(until, now));
        }

        Ok(RateDecision::allow())
    }

    /// `check` that turns a denial into `IdentityError::RateLimited`
    pub async fn enforce(&self, scope: Scope, key: &str) -> IdentityResult<()> {
        self.check(scope, key).await?.into_result()
    }

    /// Clear a key's counter and block
    pub async fn reset(&self, scope: Scope, key: &str) -> IdentityResult<()> {
        self.store.delete(&scope.key(key)).await
    }

    /// Remove entries whose window and block have both elapsed
    pub async fn sweep(&self) -> IdentityResult<usize> {
        self.store.sweep(self.clock.now()).await
    }
}

/// Client address: first X-Forwarded-For hop, else the transport peer
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn limiter() -> (AuthRateLimiter, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::new());
        (
            AuthRateLimiter::new(store.clone(), clock.clone(), true),
            clock,
            store,
        )
    }

    #[tokio::test]
    async fn test_threshold_plus_one_is_rejected() {
        let (limiter, _, _) = limiter();

        for _ in 0..3 {
            assert!(limiter.check(Scope::LoginAccount, "a@example.com").await.unwrap().allowed);
        }
        let decision = limiter.check(Scope::LoginAccount, "a@example.com").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, Some(3600));
    }

    #[tokio::test]
    async fn test_block_outlasts_window() {
        let (limiter, clock, _) = limiter();
        for _ in 0..6 {
            limiter.check(Scope::LoginIp, "10.0.0.1").await.unwrap();
        }

        // Window has elapsed but the 30 minute block has not
        clock.advance(Duration::minutes(20));
        let decision = limiter.check(Scope::LoginIp, "10.0.0.1").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, Some(600));

        clock.advance(Duration::minutes(10));
        assert!(limiter.check(Scope::LoginIp, "10.0.0.1").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_elapsed_window_resets_count() {
        let (limiter, clock, _) = limiter();
        for _ in 0..3 {
            limiter.check(Scope::LoginAccount, "a@example.com").await.unwrap();
        }
        clock.advance(Duration::minutes(15));
        for _ in 0..3 {
            assert!(limiter.check(Scope::LoginAccount, "a@example.com").await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_scopes_and_keys_are_independent() {
        let (limiter, _, _) = limiter();
        for _ in 0..4 {
            limiter.check(Scope::LoginAccount, "a@example.com").await.unwrap();
        }
        assert!(!limiter.check(Scope::LoginAccount, "A@Example.com ").await.unwrap().allowed);
        assert!(limiter.check(Scope::LoginAccount, "b@example.com").await.unwrap().allowed);
        assert!(limiter.check(Scope::ResetAccount, "a@example.com").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_clears_block() {
        let (limiter, _, _) = limiter();
        for _ in 0..4 {
            limiter.check(Scope::LoginAccount, "a@example.com").await.unwrap();
        }
        limiter.reset(Scope::LoginAccount, "a@example.com").await.unwrap();
        assert!(limiter.check(Scope::LoginAccount, "a@example.com").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_disabled_limiter_always_allows() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = AuthRateLimiter::new(Arc::new(MemoryStore::new()), clock, false);
        for _ in 0..20 {
            assert!(limiter.check(Scope::SignupIp, "10.0.0.1").await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_sweep_drops_stale_entries() {
        let (limiter, clock, store) = limiter();
        limiter.check(Scope::SignupIp, "10.0.0.1").await.unwrap();
        assert_eq!(store.len(), 1);

        clock.advance(Duration::hours(2));
        assert_eq!(limiter.sweep().await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "192.168.1.5:4000".parse().unwrap();
        assert_eq!(client_ip(&headers, Some(peer)), "192.168.1.5");
        assert_eq!(client_ip(&headers, None), "unknown");

        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.7");
    }
}

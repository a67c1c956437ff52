/// Coarse per-IP request throttle applied to every route
use super::client_ip;
use crate::{context::AppContext, error::IdentityError, metrics};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    clock::{Clock, DefaultClock},
    DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorLimiter,
};
use std::{net::SocketAddr, num::NonZeroU32, sync::Arc};

#[derive(Clone)]
pub struct GlobalThrottle {
    limiter: Arc<DefaultKeyedRateLimiter<String>>,
    clock: DefaultClock,
}

impl GlobalThrottle {
    pub fn new(requests_per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: Arc::new(GovernorLimiter::keyed(quota)),
            clock: DefaultClock::default(),
        }
    }

    /// Err carries the seconds until the next request would be admitted
    pub fn check(&self, ip: &str) -> Result<(), u64> {
        self.limiter.check_key(&ip.to_string()).map_err(|not_until| {
            not_until
                .wait_time_from(self.clock.now())
                .as_secs()
                .max(1)
        })
    }

    /// Forget idle per-IP state
    pub fn sweep(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }
}

/// Throttle middleware
pub async fn throttle_middleware(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Result<Response, IdentityError> {
    if !ctx.config.rate_limit.enabled {
        return Ok(next.run(request).await);
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ip = client_ip(request.headers(), peer);

    if let Err(retry_after_secs) = ctx.throttle.check(&ip) {
        tracing::warn!(ip = %ip, "Global request throttle exceeded");
        metrics::record_rate_limited("global");
        return Err(IdentityError::RateLimited { retry_after_secs });
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_is_keyed_by_ip() {
        let throttle = GlobalThrottle::new(2);

        assert!(throttle.check("10.0.0.1").is_ok());
        assert!(throttle.check("10.0.0.1").is_ok());
        let retry = throttle.check("10.0.0.1").unwrap_err();
        assert!(retry >= 1);

        assert!(throttle.check("10.0.0.2").is_ok());
    }
}

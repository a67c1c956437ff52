/// Request extractors and middleware shared by the API handlers
use crate::{
    error::{IdentityError, IdentityResult},
    metrics,
    rate_limit::client_ip,
    sessions::ClientInfo,
};
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, ConnectInfo, FromRequestParts, MatchedPath, Request},
    http::{header::USER_AGENT, request::Parts},
    middleware::Next,
    response::Response,
    Json,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Instant;

/// User agents longer than this are truncated before storage
const MAX_USER_AGENT_LEN: usize = 512;

#[async_trait]
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect());

        Ok(ClientInfo {
            ip_address: client_ip(&parts.headers, peer),
            user_agent,
        })
    }
}

/// Turn a JSON body rejection into a 400 with the standard error body
pub fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> IdentityResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| IdentityError::Validation(rejection.body_text()))
}

/// Count requests and latencies by route
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    metrics::record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

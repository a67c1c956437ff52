/// Unified error types for the Homestead identity service
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for identity operations
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Bad credentials, missing or invalid tokens
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Password rejected by the credential validator
    #[error("Password does not meet requirements")]
    WeakPassword(Vec<String>),

    /// Account temporarily locked after repeated failures
    #[error("Account is locked. Try again in {remaining_minutes} minutes")]
    Locked { remaining_minutes: i64 },

    /// Too many attempts for a rate-limit key
    #[error("Too many attempts. Try again in {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Row changed underneath a guarded update too many times
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage did not answer in time
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JWT encoding errors
    #[error("JWT error: {0}")]
    Jwt(String),
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_minutes: Option<i64>,
}

impl ErrorResponse {
    fn new(error: &str, message: String) -> Self {
        Self {
            error: error.to_string(),
            message,
            violations: None,
            retry_after: None,
            remaining_minutes: None,
        }
    }
}

/// Convert IdentityError to HTTP response
impl IntoResponse for IdentityError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            IdentityError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("AuthenticationRequired", self.to_string()),
            ),
            IdentityError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("InvalidRequest", self.to_string()),
            ),
            IdentityError::WeakPassword(violations) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    violations: Some(violations.clone()),
                    ..ErrorResponse::new("WeakPassword", self.to_string())
                },
            ),
            IdentityError::Locked { remaining_minutes } => (
                StatusCode::LOCKED,
                ErrorResponse {
                    remaining_minutes: Some(*remaining_minutes),
                    ..ErrorResponse::new("AccountLocked", self.to_string())
                },
            ),
            IdentityError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse {
                    retry_after: Some(*retry_after_secs),
                    ..ErrorResponse::new("RateLimitExceeded", self.to_string())
                },
            ),
            IdentityError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("NotFound", self.to_string()),
            ),
            IdentityError::Conflict(_) => (
                StatusCode::CONFLICT,
                ErrorResponse::new("Conflict", self.to_string()),
            ),
            IdentityError::Unavailable(_) => {
                tracing::error!("Request failed closed: {}", self);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::new(
                        "ServiceUnavailable",
                        "Service temporarily unavailable".to_string(),
                    ),
                )
            }
            IdentityError::Database(_)
            | IdentityError::Internal(_)
            | IdentityError::Io(_)
            | IdentityError::Jwt(_) => {
                tracing::error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new(
                        "InternalServerError",
                        "Internal server error".to_string(), // Don't leak details
                    ),
                )
            }
        };

        let mut response = (status, Json(body)).into_response();
        if let IdentityError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for identity operations
pub type IdentityResult<T> = Result<T, IdentityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = vec![
            (IdentityError::Authentication("x".into()), StatusCode::UNAUTHORIZED),
            (IdentityError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (IdentityError::WeakPassword(vec![]), StatusCode::BAD_REQUEST),
            (IdentityError::Locked { remaining_minutes: 3 }, StatusCode::LOCKED),
            (
                IdentityError::RateLimited { retry_after_secs: 10 },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (IdentityError::Conflict("x".into()), StatusCode::CONFLICT),
            (IdentityError::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (IdentityError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_rate_limited_sets_retry_after_header() {
        let response = IdentityError::RateLimited { retry_after_secs: 42 }.into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "42"
        );
    }
}

/// Health and metrics endpoints
///
/// - `/health`: liveness, always answers while the process is up
/// - `/health/ready`: readiness, fails with 503 when storage does not answer
/// - `/metrics`: Prometheus text exposition

use crate::{context::AppContext, db::bounded, error::IdentityResult, metrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::time::Instant;

/// Health status response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Overall status: "healthy", "degraded", or "unhealthy"
    pub status: String,

    pub version: String,

    pub checks: Vec<ComponentHealth>,
}

/// Health status of individual component
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub name: String,

    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build health check routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_basic))
        .route("/health/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
}

/// Basic health check
pub async fn health_basic() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness check with per-component detail
pub async fn readiness_check(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let checks = vec![check_database_detailed(&ctx).await];
    let status = determine_overall_status(&checks);

    let code = match status.as_str() {
        "unhealthy" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    (
        code,
        Json(HealthStatus {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks,
        }),
    )
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

/// Check database connectivity
async fn check_database(ctx: &AppContext) -> IdentityResult<()> {
    bounded(ctx.config.storage.timeout, "health check", async {
        sqlx::query("SELECT 1").fetch_one(&ctx.db).await?;
        Ok(())
    })
    .await
}

async fn check_database_detailed(ctx: &AppContext) -> ComponentHealth {
    let start = Instant::now();
    let result = check_database(ctx).await;
    let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    match result {
        Ok(()) => ComponentHealth {
            name: "database".to_string(),
            status: "healthy".to_string(),
            response_time_ms: Some(elapsed),
            error: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed: database");
            ComponentHealth {
                name: "database".to_string(),
                status: "unhealthy".to_string(),
                response_time_ms: Some(elapsed),
                error: Some(e.to_string()),
            }
        }
    }
}

/// Determine overall health status from individual checks
fn determine_overall_status(checks: &[ComponentHealth]) -> String {
    let unhealthy_count = checks.iter().filter(|c| c.status == "unhealthy").count();
    let degraded_count = checks.iter().filter(|c| c.status == "degraded").count();

    if unhealthy_count > 0 {
        "unhealthy".to_string()
    } else if degraded_count > 0 {
        "degraded".to_string()
    } else {
        "healthy".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(status: &str) -> ComponentHealth {
        ComponentHealth {
            name: "db".to_string(),
            status: status.to_string(),
            response_time_ms: Some(5),
            error: None,
        }
    }

    #[test]
    fn test_determine_overall_status() {
        assert_eq!(determine_overall_status(&[component("healthy")]), "healthy");
        assert_eq!(
            determine_overall_status(&[component("healthy"), component("degraded")]),
            "degraded"
        );
        assert_eq!(
            determine_overall_status(&[component("degraded"), component("unhealthy")]),
            "unhealthy"
        );
    }

    #[test]
    fn test_health_status_serialization() {
        let health = HealthStatus {
            status: "healthy".to_string(),
            version: "0.1.0".to_string(),
            checks: vec![component("healthy")],
        };

        let json = serde_json::to_string(&health).unwrap();
        assert!(json.contains("responseTimeMs"));
        assert!(json.contains("0.1.0"));
    }
}

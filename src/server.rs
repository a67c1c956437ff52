/// HTTP server setup and routing
use crate::{
    api::middleware::track_metrics,
    context::AppContext,
    error::{IdentityError, IdentityResult},
    rate_limit::throttle_middleware,
};
use axum::{
    http::{header, Method, StatusCode},
    middleware,
    response::Json,
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Build the main application router
/// Returns Router<()> because state is already provided
pub fn build_router(ctx: AppContext) -> Router {
    // Create CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .merge(crate::api::routes())
        // Runs after routing so the matched path is known
        .route_layer(middleware::from_fn(track_metrics))
        // Provide state - converts Router<AppContext> to Router<()>
        .with_state(ctx.clone())
        .fallback(not_found)
        // Coarse per-IP throttle ahead of every handler
        .layer(middleware::from_fn_with_state(ctx, throttle_middleware))
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Start the HTTP server
pub async fn serve(ctx: AppContext) -> IdentityResult<()> {
    let addr = format!("{}:{}", ctx.config.service.hostname, ctx.config.service.port);

    info!("Homestead auth v{} listening on {}", ctx.config.service.version, addr);
    info!("   Public URL: {}", ctx.config.service.public_url);

    let app = build_router(ctx);

    // Create TCP listener
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| IdentityError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    // Peer addresses feed the rate limiter when no forwarded-for header is present
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| IdentityError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

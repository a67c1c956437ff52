/// Homestead auth server entry point
use anyhow::Context;
use homestead_auth::{jobs::JobScheduler, server, AppContext, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = ServerConfig::from_env().context("Failed to load configuration")?;

    // Initialize logging
    let fmt_layer = if config.logging.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(fmt_layer)
        .init();

    tracing::info!("Starting Homestead auth v{}", env!("CARGO_PKG_VERSION"));

    // Create application context
    let ctx = AppContext::new(config)
        .await
        .context("Failed to initialize application context")?;
    let ctx = Arc::new(ctx);

    // Start background jobs
    let scheduler = Arc::new(JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    // Start server
    server::serve((*ctx).clone()).await.context("Server exited with an error")?;

    Ok(())
}

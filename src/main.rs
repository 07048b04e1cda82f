//! Sandbox Control - HTTP Server Entry Point
//!
//! Starts the control plane that sandbox workers and operators talk to.

use sandbox_control::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandbox_control=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        store = ?config.store.store_type,
        dev_mode = config.dev_mode,
        provisioner = config.provisioner_url.as_deref().unwrap_or("external"),
        "Loaded configuration"
    );

    // Start HTTP server
    info!("Starting server on {}:{}", config.host, config.port);
    api::serve(config).await?;

    Ok(())
}

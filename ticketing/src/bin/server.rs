//! Seatkeeper server
//!
//! Runs the expiry reaper and the metrics endpoint over the configured inventory store.
//!
//! # Usage
//!
//! ```bash
//! # Start PostgreSQL
//! docker compose up -d
//!
//! # Run server
//! cargo run --bin server
//! ```

use anyhow::Context;
use ticketing::{Config, TicketingApp};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,seatkeeper=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Seatkeeper...");

    let config = Config::from_env();
    tracing::info!(
        backend = %config.store.backend,
        reaper_interval_secs = config.reaper.interval_seconds,
        metrics_port = config.server.metrics_port,
        "Configuration loaded"
    );

    let app = TicketingApp::new(config)
        .await
        .context("Failed to initialize application")?;

    tracing::info!("Press Ctrl+C to shutdown");
    app.run().await.context("Seatkeeper stopped with an error")?;
    Ok(())
}

//! Box Office server
//!
//! Runs the outbox relay and the payment, account and notification sagas
//! against `PostgreSQL` and `RedPanda` until Ctrl+C or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Start infrastructure
//! docker compose up -d
//!
//! # Run server
//! cargo run --bin server
//! ```

use anyhow::Context;
use boxoffice_runtime::metrics::MetricsServer;
use std::net::SocketAddr;
use ticketing::Config;
use ticketing::runtime::Application;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ticketing=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        redpanda = %config.redpanda.brokers,
        consumer_group_prefix = %config.redpanda.consumer_group_prefix,
        "Configuration loaded"
    );

    let metrics_addr: SocketAddr = format!("{}:{}", config.metrics.host, config.metrics.port)
        .parse()
        .context("invalid metrics address")?;
    MetricsServer::new(metrics_addr).start()?;

    let app = Application::connect(&config).await.context("failed to start")?;
    tracing::info!("Box Office server is running, press Ctrl+C to shut down");

    app.run().await?;
    Ok(())
}

//! Uptrail daemon.
//!
//! Monitors the active targets stored in the SQLite database and logs the
//! notifications it would send.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uptrail::db::Store;
use uptrail::notifier::LogDelivery;
use uptrail::probe::NetworkProber;
use uptrail::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("uptrail=info".parse()?))
        .init();

    let cfg = EngineConfig::load();
    tracing::info!("Starting Uptrail...");
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let prober = Arc::new(NetworkProber::new(cfg.body_sample_limit)?);
    let engine = Engine::start(cfg, store, prober, Arc::new(LogDelivery));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    engine.shutdown().await;

    Ok(())
}

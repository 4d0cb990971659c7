//! tether balancer.
//!
//! Watches the coordination store and maintains one backend pool per
//! registered service. Each pool picks uniformly among ready instances and
//! disciplines failing ones with exponential backoff.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tether_balancer::{config::Config, run_sync_loop, PoolDirectory};
use tether_store::{MemoryStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TETHER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tether balancer");

    // In-memory store for development; concrete store backends plug in
    // here once deployed against a real coordination cluster.
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let pools = Arc::new(PoolDirectory::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    run_sync_loop(store, pools, shutdown_rx).await
}

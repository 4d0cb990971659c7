//! tether host agent.
//!
//! Runs on each host and keeps the coordination store's instance records
//! in step with the containers running locally: matching containers are
//! registered as service instances, dead or unmatched ones are cleaned up.
//! The reconciler is supervised in-process and restarted with a fixed
//! backoff when the store or event stream fails.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tether_agent::config::{self, Config, NetworkMode};
use tether_agent::reconciler::{Reconciler, RESTART_BACKOFF};
use tether_agent::runtime::{ContainerRuntime, MockRuntime};
use tether_store::{MemoryStore, Store};

#[derive(Parser, Debug)]
#[command(name = "tether-agent", about = "Registers local containers as service instances")]
struct Cli {
    /// IP address for instances with mapped ports.
    #[arg(long)]
    host_ip: Option<String>,

    /// Kind of network to assume for containers ("local" or "global").
    #[arg(long, default_value = config::LOCAL)]
    network_mode: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(network_mode) = NetworkMode::parse(&cli.network_mode) else {
        eprintln!("Unknown network mode \"{}\"", cli.network_mode);
        std::process::exit(1);
    };

    let log_level = std::env::var("TETHER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    // Initialize tracing (prefer RUST_LOG, fallback to TETHER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tether agent");

    let (host_ip, source) = config::resolve_host_ip(cli.host_ip.as_deref())?;
    info!(host_ip = %host_ip, source = %source, network_mode = %network_mode, "Using host IP address");

    let config = Config {
        host_ip,
        network_mode,
        log_level,
    };

    // In-memory store and scripted runtime for development; concrete
    // backends plug in here once deployed against a real coordination
    // cluster and container daemon.
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // Supervise the reconciler: a clean shutdown ends the process, a
    // failure restarts it after a fixed backoff.
    loop {
        let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&runtime), &config);
        match reconciler.run(shutdown_rx.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                error!(
                    error = %e,
                    restart_secs = RESTART_BACKOFF.as_secs(),
                    "reconciler failed; restarting"
                );
            }
        }

        let mut shutdown = shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(RESTART_BACKOFF) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

//! Store synchronization for the balancer.
//!
//! Watches the coordination store for service and instance changes and
//! keeps one backend pool per service. The watch is subscribed before the
//! initial scan so nothing written in between is lost; instance-level
//! changes are folded into per-service refreshes.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tether_store::{ServiceChange, Store, WatchOptions};

use crate::pool::{Backend, PoolDirectory};

const CHANGE_BUFFER: usize = 64;

/// Run the pool sync loop until shutdown.
///
/// Failing to establish the watch is fatal; refresh failures for a single
/// service are logged and dropped.
pub async fn run_sync_loop(
    store: Arc<dyn Store>,
    pools: Arc<PoolDirectory>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (tx, mut changes) = mpsc::channel::<ServiceChange>(CHANGE_BUFFER);
    store
        .watch_services(
            tx,
            WatchOptions {
                with_instance_changes: true,
            },
        )
        .await
        .context("establishing service watch")?;

    // Seed pools for everything already in the store.
    let mut names = Vec::new();
    store
        .foreach_service_instance(Some(&mut |name, _spec| names.push(name.to_string())), None)
        .await
        .context("scanning services")?;
    for name in &names {
        refresh_service(store.as_ref(), &pools, name).await;
    }
    info!(service_count = names.len(), "balancer pools seeded");

    loop {
        tokio::select! {
            change = changes.recv() => {
                let Some(change) = change else {
                    anyhow::bail!("service watch closed");
                };
                if change.deleted {
                    info!(service = %change.name, "service deleted, dropping pool");
                    pools.remove(&change.name).await;
                } else {
                    refresh_service(store.as_ref(), &pools, &change.name).await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("pool sync shutting down");
                    pools.stop_all().await;
                    return Ok(());
                }
            }
        }
    }
}

/// Re-read a service's instances and reconcile its pool.
async fn refresh_service(store: &dyn Store, pools: &PoolDirectory, service: &str) {
    let mut backends = Vec::new();
    let result = store
        .foreach_instance(service, &mut |name, instance| {
            backends.push(Backend::new(name, instance.socket_addr()));
        })
        .await;

    if let Err(e) = result {
        warn!(service = %service, error = %e, "failed to read service instances");
        return;
    }

    debug!(service = %service, backend_count = backends.len(), "refreshing pool");
    pools.update_service(service, backends).await;
}

//! Reconciliation loop keeping the store in step with local containers.
//!
//! The reconciler:
//! - Subscribes to catalog changes and container lifecycle events, then
//!   snapshots both worlds (subscribe-before-read so nothing is lost)
//! - Registers instances for containers matching a service's specs
//! - Removes this host's records when containers die or stop matching
//!
//! It runs as a single task multiplexing its inputs with `select!`, which
//! gives it exclusive ownership of the service and container maps without
//! locks. Store failures are fatal and bounce the loop back to the
//! supervisor; per-container and per-delta failures are logged and skipped.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tether_model::{Instance, ServiceSpec};
use tether_store::{ServiceChange, Store, WatchOptions};

use crate::address::extract_address;
use crate::config::{Config, NetworkMode};
use crate::labels::{instance_labels, ContainerLabels};
use crate::runtime::{ContainerEvent, ContainerRuntime, ContainerSnapshot, EventStatus};

/// Delay before the supervisor restarts a failed reconciler.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(10);

const CHANGE_BUFFER: usize = 64;

/// Container IDs are long hashes; logs carry a prefix.
fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Host agent reconciler.
pub struct Reconciler {
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    host_ip: IpAddr,
    #[allow(dead_code)] // Read at startup; addressing is per-spec.
    network_mode: NetworkMode,
    services: HashMap<String, ServiceSpec>,
    containers: HashMap<String, ContainerSnapshot>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            runtime,
            host_ip: config.host_ip,
            network_mode: config.network_mode,
            services: HashMap::new(),
            containers: HashMap::new(),
        }
    }

    /// Host identity stamped on every record this agent writes, and the
    /// sole criterion for which records it may clean up.
    fn owner_id(&self) -> String {
        self.host_ip.to_string()
    }

    /// Run until shutdown. Returns `Err` on failures that require a
    /// restart (store unavailable, event stream lost).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        // Subscribe to both inputs before snapshotting state, so changes
        // racing the snapshots are replayed to us rather than lost.
        let (tx, mut changes) = mpsc::channel::<ServiceChange>(CHANGE_BUFFER);
        self.store
            .watch_services(tx, WatchOptions::default())
            .await
            .context("establishing service watch")?;
        let mut events = self
            .runtime
            .events()
            .await
            .context("subscribing to container events")?;

        self.read_in_services().await?;
        self.read_existing_containers().await?;
        self.reconcile().await?;

        info!(
            owner_id = %self.owner_id(),
            services = self.services.len(),
            containers = self.containers.len(),
            "agent reconciler started"
        );

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        anyhow::bail!("container event stream closed");
                    };
                    self.handle_container_event(event).await?;
                }
                change = changes.recv() => {
                    let Some(change) = change else {
                        anyhow::bail!("service watch closed");
                    };
                    self.handle_service_change(change).await?;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Snapshot all registered services.
    async fn read_in_services(&mut self) -> Result<()> {
        let mut services = Vec::new();
        self.store
            .foreach_service_instance(
                Some(&mut |name, spec| services.push((name.to_string(), spec.clone()))),
                None,
            )
            .await
            .context("reading services")?;
        self.services = services.into_iter().collect();
        Ok(())
    }

    /// Snapshot all running containers. Individual inspect failures skip
    /// that container.
    async fn read_existing_containers(&mut self) -> Result<()> {
        let summaries = self
            .runtime
            .list_containers()
            .await
            .context("listing containers")?;
        for summary in summaries {
            match self.runtime.inspect_container(&summary.id).await {
                Ok(snapshot) => {
                    self.containers.insert(snapshot.id.clone(), snapshot);
                }
                Err(e) => {
                    warn!(container = %short_id(&summary.id), error = %e, "failed to inspect container");
                }
            }
        }
        Ok(())
    }

    /// Startup pass: register everything that matches, then drop our own
    /// records whose container is no longer running here.
    async fn reconcile(&mut self) -> Result<()> {
        for container in self.containers.values() {
            self.match_container(container).await?;
        }

        let mut stale = Vec::new();
        {
            let containers = &self.containers;
            let owner = self.owner_id();
            self.store
                .foreach_service_instance(
                    None,
                    Some(&mut |service, name, instance| {
                        if !containers.contains_key(name) && instance.owner_id == owner {
                            stale.push((service.to_string(), name.to_string()));
                        }
                    }),
                )
                .await
                .context("scanning instances for stale records")?;
        }
        for (service, name) in stale {
            info!(service = %service, instance = %short_id(&name), "removing stale instance");
            self.store
                .remove_instance(&service, &name)
                .await
                .context("removing stale instance")?;
        }
        Ok(())
    }

    /// Evaluate a container against every known service.
    async fn match_container(&self, container: &ContainerSnapshot) -> Result<()> {
        for (name, spec) in &self.services {
            self.evaluate(container, name, spec).await?;
        }
        Ok(())
    }

    /// Evaluate a container against one service's instance specs, in
    /// declaration order; the first spec that matches and yields an
    /// address wins and its group is recorded. Returns whether the
    /// container is an instance of the service.
    async fn evaluate(
        &self,
        container: &ContainerSnapshot,
        service_name: &str,
        spec: &ServiceSpec,
    ) -> Result<bool> {
        for instance_spec in &spec.instance_specs {
            if !instance_spec.selector.matches(&ContainerLabels(container)) {
                continue;
            }
            let Some((address, port)) =
                extract_address(&instance_spec.address, container, self.host_ip)
            else {
                debug!(
                    container = %short_id(&container.id),
                    group = %instance_spec.group,
                    "selector matched but no address extractable"
                );
                continue;
            };

            let instance = Instance {
                owner_id: self.owner_id(),
                address,
                port,
                labels: instance_labels(container),
                group: instance_spec.group.clone(),
            };
            self.store
                .add_instance(service_name, &container.id, instance)
                .await
                .context("registering instance")?;
            info!(
                service = %service_name,
                instance = %short_id(&container.id),
                address = %address,
                port,
                group = %instance_spec.group,
                "registered instance"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// A service definition changed: recompute which containers belong and
    /// drop our records for those that no longer do.
    async fn redefine_service(&self, service_name: &str) -> Result<()> {
        let Some(spec) = self.services.get(service_name).cloned() else {
            return Ok(());
        };

        let mut keep = HashSet::new();
        for container in self.containers.values() {
            if self.evaluate(container, service_name, &spec).await? {
                keep.insert(container.id.clone());
            }
        }

        // Removal is scoped to our own records so agents on other hosts
        // keep authority over theirs.
        let mut remove = Vec::new();
        let owner = self.owner_id();
        self.store
            .foreach_instance(service_name, &mut |instance_name, instance| {
                if !keep.contains(instance_name) && instance.owner_id == owner {
                    remove.push(instance_name.to_string());
                }
            })
            .await
            .context("scanning service instances")?;
        for instance_name in remove {
            info!(
                service = %service_name,
                instance = %short_id(&instance_name),
                "removing instance no longer matching service"
            );
            self.store
                .remove_instance(service_name, &instance_name)
                .await
                .context("removing unmatched instance")?;
        }
        Ok(())
    }

    /// Drop a dead container's records from every registered service.
    async fn deregister(&self, container_id: &str) -> Result<()> {
        for service_name in self.services.keys() {
            if self.store.check_registered_service(service_name).await? {
                self.store
                    .remove_instance(service_name, container_id)
                    .await
                    .context("deregistering instance")?;
                debug!(
                    service = %service_name,
                    instance = %short_id(container_id),
                    "deregistered instance"
                );
            }
        }
        Ok(())
    }

    async fn handle_container_event(&mut self, event: ContainerEvent) -> Result<()> {
        match event.status {
            EventStatus::Start => {
                let snapshot = match self.runtime.inspect_container(&event.id).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(
                            container = %short_id(&event.id),
                            error = %e,
                            "failed to inspect started container"
                        );
                        return Ok(());
                    }
                };
                info!(container = %short_id(&event.id), "container started");
                self.containers.insert(event.id.clone(), snapshot.clone());
                self.match_container(&snapshot).await
            }
            EventStatus::Die => {
                if !self.containers.contains_key(&event.id) {
                    warn!(container = %short_id(&event.id), "die event for unknown container");
                    return Ok(());
                }
                info!(container = %short_id(&event.id), "container died");
                self.deregister(&event.id).await?;
                self.containers.remove(&event.id);
                Ok(())
            }
            EventStatus::Other => Ok(()),
        }
    }

    async fn handle_service_change(&mut self, change: ServiceChange) -> Result<()> {
        if change.deleted {
            self.services.remove(&change.name);
            info!(service = %change.name, "service deleted");
            return Ok(());
        }

        let spec = match self.store.get_service_details(&change.name).await {
            Ok(spec) => spec,
            Err(e) => {
                warn!(service = %change.name, error = %e, "failed to retrieve service details");
                return Ok(());
            }
        };
        info!(
            service = %change.name,
            spec_count = spec.instance_specs.len(),
            "service updated"
        );
        self.services.insert(change.name.clone(), spec);
        self.redefine_service(&change.name).await
    }
}

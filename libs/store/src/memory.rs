//! In-memory [`Store`] implementation.
//!
//! Backs the integration tests and the development stubs. Watch deliveries
//! fan out over a broadcast channel with one forwarding task per
//! subscriber, so slow subscribers lag (and log) instead of blocking
//! writers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

use tether_model::{Instance, ServiceSpec};

use crate::{
    InstanceEntryFn, InstanceFn, ServiceChange, ServiceFn, Store, StoreError, StoreResult,
    WatchOptions,
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
enum StoreEvent {
    Service(ServiceChange),
    Instances { service: String },
}

#[derive(Debug, Default)]
struct ServiceRecord {
    spec: ServiceSpec,
    instances: BTreeMap<String, Instance>,
}

/// In-memory coordination store.
pub struct MemoryStore {
    services: RwLock<BTreeMap<String, ServiceRecord>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            services: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Create or replace a service definition in the catalog.
    ///
    /// Catalog administration is not part of the [`Store`] trait (the agent
    /// and balancer only consume definitions); tests and seeding code drive
    /// it through these inherent methods.
    pub async fn register_service(&self, name: &str, spec: ServiceSpec) {
        {
            let mut services = self.services.write().await;
            services
                .entry(name.to_string())
                .or_insert_with(ServiceRecord::default)
                .spec = spec;
        }
        debug!(service = %name, "service registered");
        self.emit(StoreEvent::Service(ServiceChange {
            name: name.to_string(),
            deleted: false,
        }));
    }

    /// Remove a service definition and all its instance records.
    pub async fn deregister_service(&self, name: &str) {
        let existed = {
            let mut services = self.services.write().await;
            services.remove(name).is_some()
        };
        if existed {
            debug!(service = %name, "service deregistered");
            self.emit(StoreEvent::Service(ServiceChange {
                name: name.to_string(),
                deleted: true,
            }));
        }
    }

    fn emit(&self, event: StoreEvent) {
        // Err just means nobody is watching.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn foreach_service_instance(
        &self,
        service_fn: Option<ServiceFn<'_>>,
        instance_fn: Option<InstanceFn<'_>>,
    ) -> StoreResult<()> {
        let services = self.services.read().await;
        if let Some(f) = service_fn {
            for (name, record) in services.iter() {
                f(name, &record.spec);
            }
        }
        if let Some(f) = instance_fn {
            for (name, record) in services.iter() {
                for (instance_name, instance) in record.instances.iter() {
                    f(name, instance_name, instance);
                }
            }
        }
        Ok(())
    }

    async fn foreach_instance(
        &self,
        service_name: &str,
        f: InstanceEntryFn<'_>,
    ) -> StoreResult<()> {
        let services = self.services.read().await;
        let record = services
            .get(service_name)
            .ok_or_else(|| StoreError::NotFound(format!("service {service_name}")))?;
        for (instance_name, instance) in record.instances.iter() {
            f(instance_name, instance);
        }
        Ok(())
    }

    async fn add_instance(
        &self,
        service_name: &str,
        instance_name: &str,
        instance: Instance,
    ) -> StoreResult<()> {
        {
            let mut services = self.services.write().await;
            let record = services
                .get_mut(service_name)
                .ok_or_else(|| StoreError::NotFound(format!("service {service_name}")))?;
            record
                .instances
                .insert(instance_name.to_string(), instance);
        }
        self.emit(StoreEvent::Instances {
            service: service_name.to_string(),
        });
        Ok(())
    }

    async fn remove_instance(&self, service_name: &str, instance_name: &str) -> StoreResult<()> {
        let removed = {
            let mut services = self.services.write().await;
            services
                .get_mut(service_name)
                .map(|record| record.instances.remove(instance_name).is_some())
                .unwrap_or(false)
        };
        if removed {
            self.emit(StoreEvent::Instances {
                service: service_name.to_string(),
            });
        }
        Ok(())
    }

    async fn check_registered_service(&self, service_name: &str) -> StoreResult<bool> {
        let services = self.services.read().await;
        Ok(services.contains_key(service_name))
    }

    async fn get_service_details(&self, service_name: &str) -> StoreResult<ServiceSpec> {
        let services = self.services.read().await;
        services
            .get(service_name)
            .map(|record| record.spec.clone())
            .ok_or_else(|| StoreError::NotFound(format!("service {service_name}")))
    }

    async fn watch_services(
        &self,
        out: mpsc::Sender<ServiceChange>,
        options: WatchOptions,
    ) -> StoreResult<()> {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                let change = match rx.recv().await {
                    Ok(StoreEvent::Service(change)) => change,
                    Ok(StoreEvent::Instances { service }) => {
                        if !options.with_instance_changes {
                            continue;
                        }
                        ServiceChange {
                            name: service,
                            deleted: false,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "service watch lagged; continuing");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if out.send(change).await.is_err() {
                    // Subscriber went away.
                    break;
                }
            }
        });
        Ok(())
    }
}

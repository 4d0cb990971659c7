//! # tether-store
//!
//! Interface to the coordination store that the agent writes instance
//! records into and the balancer watches. The store is assumed to be a
//! consistent KV space, linearizable per key, with monotonic watch
//! deliveries; concrete backends implement [`Store`], and this crate ships
//! [`MemoryStore`] as the in-process implementation used by tests and the
//! development stubs.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use tether_model::{Instance, ServiceSpec};

mod memory;

pub use memory::MemoryStore;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The named service or instance does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// Establishing or maintaining a watch failed.
    #[error("watch error: {0}")]
    Watch(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A change to a service visible through [`Store::watch_services`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceChange {
    /// Name of the affected service.
    pub name: String,
    /// True when the service was removed from the catalog.
    pub deleted: bool,
}

/// Options controlling what a service watch delivers.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Also surface instance-level writes as (non-deleted) changes for
    /// their service. The balancer subscribes this way so pool membership
    /// tracks registrations; the agent does not, since it produces those
    /// writes itself.
    pub with_instance_changes: bool,
}

/// Visitor for service entries: `(service_name, spec)`.
pub type ServiceFn<'a> = &'a mut (dyn FnMut(&str, &ServiceSpec) + Send);

/// Visitor for instance entries across services:
/// `(service_name, instance_name, instance)`.
pub type InstanceFn<'a> = &'a mut (dyn FnMut(&str, &str, &Instance) + Send);

/// Visitor for instance entries of one service: `(instance_name, instance)`.
pub type InstanceEntryFn<'a> = &'a mut (dyn FnMut(&str, &Instance) + Send);

/// The coordination store consumed by the agent and the balancer.
///
/// Visitors are synchronous; callers that need to issue further store
/// operations for visited entries collect them first and then await the
/// writes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Visit every service and/or every instance record. Either visitor
    /// may be omitted.
    async fn foreach_service_instance(
        &self,
        service_fn: Option<ServiceFn<'_>>,
        instance_fn: Option<InstanceFn<'_>>,
    ) -> StoreResult<()>;

    /// Visit every instance record of one service.
    async fn foreach_instance(
        &self,
        service_name: &str,
        f: InstanceEntryFn<'_>,
    ) -> StoreResult<()>;

    /// Register (or re-register; upserts are idempotent) an instance under
    /// a service. The service must exist.
    async fn add_instance(
        &self,
        service_name: &str,
        instance_name: &str,
        instance: Instance,
    ) -> StoreResult<()>;

    /// Remove an instance record. Removing an absent record is a no-op.
    async fn remove_instance(&self, service_name: &str, instance_name: &str) -> StoreResult<()>;

    /// Whether the service is currently registered in the catalog.
    async fn check_registered_service(&self, service_name: &str) -> StoreResult<bool>;

    /// Fetch the catalog definition of a service.
    async fn get_service_details(&self, service_name: &str) -> StoreResult<ServiceSpec>;

    /// Subscribe to service changes. Deliveries begin with changes made
    /// after this call returns, so callers subscribe before taking their
    /// initial snapshot to avoid losing updates. The subscription ends
    /// when `out`'s receiver is dropped.
    async fn watch_services(
        &self,
        out: mpsc::Sender<ServiceChange>,
        options: WatchOptions,
    ) -> StoreResult<()>;
}

//! Container runtime interface.
//!
//! The agent only needs three things from the runtime: list what is
//! running, inspect a container's config and networking, and follow
//! lifecycle events. Concrete runtimes implement [`ContainerRuntime`];
//! [`MockRuntime`] is the scripted in-tree implementation the integration
//! tests (and the development stub) run against.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

const EVENT_BUFFER: usize = 64;

/// Errors from container runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container runtime error: {0}")]
    Backend(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Lifecycle event kinds. Runtimes emit more than these; the agent only
/// interprets start and die.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Start,
    Die,
    Other,
}

/// A container lifecycle event.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub status: EventStatus,
    pub id: String,
}

/// Minimal listing entry; full detail comes from inspection.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
}

/// One host-side binding of a published container port. Values are kept as
/// the runtime reports them (the host IP may be empty or a wildcard).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// Networking view of a container.
#[derive(Debug, Clone, Default)]
pub struct NetworkSettings {
    /// Container-internal IP address.
    pub ip_address: String,
    /// Exposed ports (`"8080/tcp"`) to their host bindings, in declaration
    /// order.
    pub ports: HashMap<String, Vec<PortBinding>>,
}

/// Everything the agent reads off an inspected container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSnapshot {
    pub id: String,
    /// Image reference, `name[:tag]`.
    pub image: String,
    pub labels: BTreeMap<String, String>,
    /// Environment entries as `KEY=VALUE` strings.
    pub env: Vec<String>,
    pub network: NetworkSettings,
}

/// The container runtime consumed by the agent.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// IDs of all running containers.
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>>;

    /// Full snapshot of one container.
    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerSnapshot>;

    /// Subscribe to lifecycle events. Events emitted after this call
    /// returns are delivered; the subscription ends when the receiver is
    /// dropped.
    async fn events(&self) -> RuntimeResult<mpsc::Receiver<ContainerEvent>>;
}

#[derive(Default)]
struct MockInner {
    containers: BTreeMap<String, ContainerSnapshot>,
    broken: HashSet<String>,
    events_tx: Option<mpsc::Sender<ContainerEvent>>,
}

/// Scripted container runtime for tests and development.
#[derive(Default)]
pub struct MockRuntime {
    inner: Mutex<MockInner>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a container as already running (no event emitted).
    pub async fn add_container(&self, snapshot: ContainerSnapshot) {
        let mut inner = self.inner.lock().await;
        inner.containers.insert(snapshot.id.clone(), snapshot);
    }

    /// Record a container and emit a start event for it.
    pub async fn start_container(&self, snapshot: ContainerSnapshot) {
        let id = snapshot.id.clone();
        {
            let mut inner = self.inner.lock().await;
            inner.containers.insert(id.clone(), snapshot);
        }
        self.emit(ContainerEvent {
            status: EventStatus::Start,
            id,
        })
        .await;
    }

    /// Remove a container and emit a die event for it.
    pub async fn kill_container(&self, id: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.containers.remove(id);
        }
        self.emit(ContainerEvent {
            status: EventStatus::Die,
            id: id.to_string(),
        })
        .await;
    }

    /// Make future inspections of a container fail.
    pub async fn break_inspect(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        inner.broken.insert(id.to_string());
    }

    /// Emit an arbitrary lifecycle event.
    pub async fn emit(&self, event: ContainerEvent) {
        let tx = {
            let inner = self.inner.lock().await;
            inner.events_tx.clone()
        };
        if let Some(tx) = tx {
            // Err just means the subscriber went away.
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .containers
            .keys()
            .map(|id| ContainerSummary { id: id.clone() })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerSnapshot> {
        let inner = self.inner.lock().await;
        if inner.broken.contains(id) {
            return Err(RuntimeError::Backend(format!("inspect failed for {id}")));
        }
        inner
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn events(&self) -> RuntimeResult<mpsc::Receiver<ContainerEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut inner = self.inner.lock().await;
        inner.events_tx = Some(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str) -> ContainerSnapshot {
        ContainerSnapshot {
            id: id.to_string(),
            image: "registry/app:v1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mock_runtime_lists_and_inspects() {
        let runtime = MockRuntime::new();
        runtime.add_container(snapshot("c1")).await;

        let listed = runtime.list_containers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "c1");

        let inspected = runtime.inspect_container("c1").await.unwrap();
        assert_eq!(inspected.image, "registry/app:v1");

        assert!(matches!(
            runtime.inspect_container("nope").await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn broken_inspect_fails() {
        let runtime = MockRuntime::new();
        runtime.add_container(snapshot("c1")).await;
        runtime.break_inspect("c1").await;
        assert!(runtime.inspect_container("c1").await.is_err());
    }

    #[tokio::test]
    async fn lifecycle_events_reach_subscriber() {
        let runtime = MockRuntime::new();
        let mut events = runtime.events().await.unwrap();

        runtime.start_container(snapshot("c1")).await;
        runtime.kill_container("c1").await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.status, EventStatus::Start);
        assert_eq!(event.id, "c1");

        let event = events.recv().await.unwrap();
        assert_eq!(event.status, EventStatus::Die);
    }
}

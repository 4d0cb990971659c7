//! # tether-model
//!
//! Catalog data model shared by the tether agent and balancer.
//!
//! The coordination store holds one [`ServiceSpec`] per service plus the
//! [`Instance`] records registered under it. Agents derive instances from
//! running containers; the balancer consumes them to build its pools. Both
//! sides round-trip these types through the store as JSON, so everything
//! here is serde-derived.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

mod selector;

pub use selector::{LabelPredicate, Predicate, Selector};

/// Something that can be asked for the value of a label key.
///
/// Selector evaluation is written against this trait so the catalog side
/// (which only declares predicates) stays decoupled from the agent side
/// (which derives values from container state, including the synthetic
/// `image`, `tag`, and `env.*` keys).
pub trait Labeled {
    /// Value for `key`, or the empty string if the source has none.
    fn label(&self, key: &str) -> String;
}

/// How an instance spec derives a reachable address from a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMode {
    /// Use the host-side binding of a published container port.
    Mapped,
    /// Use the container's own network address with a fixed port.
    Fixed,
}

/// Addressing rule attached to an instance spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpec {
    pub mode: AddressMode,
    pub port: u16,
}

/// One way a container can qualify as an instance of a service.
///
/// Specs are evaluated in declaration order; the first whose selector and
/// address rule both apply wins and stamps its `group` on the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Instance group recorded on matching instances.
    pub group: String,
    /// Label predicates the container must satisfy.
    pub selector: Selector,
    /// How to derive the instance address.
    pub address: AddressSpec,
}

/// Definition of a service as stored in the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Address the balancer serves this service on, if any.
    #[serde(default)]
    pub address: Option<SocketAddr>,
    /// Instance specs in declaration order.
    #[serde(default)]
    pub instance_specs: Vec<InstanceSpec>,
}

/// A registered backend instance of a service.
///
/// Keyed in the store by `(service name, instance name)` where the instance
/// name is the container ID that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Identity of the agent that registered this record. Used only to
    /// scope stale-record cleanup to the registering host.
    pub owner_id: String,
    /// Address the instance is reachable at.
    pub address: IpAddr,
    /// Port the instance is reachable on.
    pub port: u16,
    /// Labels carried over from the container, including the synthetic
    /// `image`, `tag`, and `env.*` keys.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Instance group of the spec that matched.
    pub group: String,
}

impl Instance {
    /// Socket address of this instance.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

//! tether balancer library.
//!
//! Holds the per-service backend pools and the store sync loop that feeds
//! them. The forwarding data path consumes [`BackendPool::pick`] /
//! [`BackendPool::succeeded`] / [`BackendPool::failed`]; everything about
//! how connections are actually proxied lives outside this crate.

pub mod config;
pub mod pool;
pub mod sync;

pub use pool::{Backend, BackendPool, PickedBackend, PoolDirectory, RETRY_INTERVAL_BASE};
pub use sync::run_sync_loop;

//! tether host agent library.
//!
//! The agent keeps the coordination store's instance records in step with
//! the containers actually running on this host: containers matching a
//! service's instance specs are registered, everything else this host owns
//! is cleaned up.

pub mod address;
pub mod config;
pub mod labels;
pub mod reconciler;
pub mod runtime;

pub use config::{Config, NetworkMode};
pub use reconciler::{Reconciler, RESTART_BACKOFF};

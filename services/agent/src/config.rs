//! Agent configuration.
//!
//! The agent needs a host identity (the IP it registers mapped-port
//! instances under) and a network mode. The identity falls back from the
//! `--host-ip` flag to the `HOST_IP` environment variable to resolving the
//! machine's hostname; where it came from is logged so misconfigured hosts
//! are easy to spot.

use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};

use anyhow::{bail, Context, Result};

pub const LOCAL: &str = "local";
pub const GLOBAL: &str = "global";

/// Kind of network to assume for containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Containers are reached through host port mappings.
    Local,
    /// Containers are on a routable network.
    Global,
}

impl NetworkMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            LOCAL => Some(Self::Local),
            GLOBAL => Some(Self::Global),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => LOCAL,
            Self::Global => GLOBAL,
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this host; also the address used for mapped-port
    /// instances.
    pub host_ip: IpAddr,
    pub network_mode: NetworkMode,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Resolve the host IP: explicit flag, then `HOST_IP`, then the machine
/// hostname. Returns the address and a description of where it came from.
pub fn resolve_host_ip(flag: Option<&str>) -> Result<(IpAddr, String)> {
    if let Some(value) = flag {
        let ip = value
            .parse()
            .with_context(|| format!("invalid --host-ip '{value}'"))?;
        return Ok((ip, "argument".to_string()));
    }

    if let Ok(value) = std::env::var("HOST_IP") {
        let ip = value
            .parse()
            .with_context(|| format!("invalid HOST_IP '{value}'"))?;
        return Ok((ip, "$HOST_IP in environment".to_string()));
    }

    let hostname = nix::unistd::gethostname().context("reading machine hostname")?;
    let hostname = hostname.to_string_lossy().into_owned();
    let mut addrs = (hostname.as_str(), 0)
        .to_socket_addrs()
        .with_context(|| format!("resolving hostname '{hostname}'"))?;
    match addrs.next() {
        Some(addr) => Ok((addr.ip(), format!("resolving hostname '{hostname}'"))),
        None => bail!("hostname '{hostname}' resolved to no addresses"),
    }
}

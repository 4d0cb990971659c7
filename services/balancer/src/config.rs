//! Balancer configuration (env-driven).

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("TETHER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self { log_level })
    }
}

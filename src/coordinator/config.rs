//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::ConfigError;

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

/// Configuration for the Coordinator server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Server bind address
    pub bind_address: SocketAddr,

    /// Expected worker heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,

    /// Heartbeat intervals missed before a worker counts as stale
    pub stale_multiple: u32,

    /// Enable CORS for API
    pub enable_cors: bool,

    /// Enable request logging
    pub enable_request_logging: bool,

    /// Interval between stats broadcasts in seconds
    pub stats_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            heartbeat_interval_secs: 30,
            stale_multiple: 3,
            enable_cors: true,
            enable_request_logging: true,
            stats_interval_secs: 10,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new config builder
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }

    /// Read overrides from the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Self::builder();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            builder = builder.bind_address_str(&addr)?;
        }
        if let Some(secs) = env_parse("HEARTBEAT_INTERVAL_SECS") {
            builder = builder.heartbeat_interval_secs(secs);
        }
        if let Some(multiple) = env_parse("STALE_HEARTBEAT_MULTIPLE") {
            builder = builder.stale_multiple(multiple);
        }
        if let Some(secs) = env_parse("STATS_INTERVAL_SECS") {
            builder = builder.stats_interval_secs(secs);
        }

        builder.build()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "server.heartbeat_interval_secs",
                "must be greater than 0",
            ));
        }

        if self.stale_multiple < 2 {
            return Err(ConfigError::invalid(
                "server.stale_multiple",
                "a worker must miss at least 2 heartbeats before it is stale",
            ));
        }

        if self.stats_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "server.stats_interval_secs",
                "must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Silence after which a worker is reported stale
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * u64::from(self.stale_multiple))
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Builder for CoordinatorConfig
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    bind_address: Option<SocketAddr>,
    heartbeat_interval_secs: Option<u64>,
    stale_multiple: Option<u32>,
    enable_cors: Option<bool>,
    enable_request_logging: Option<bool>,
    stats_interval_secs: Option<u64>,
}

impl CoordinatorConfigBuilder {
    /// Set bind address
    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Set bind address from string
    pub fn bind_address_str(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.bind_address = Some(
            addr.parse()
                .map_err(|_| ConfigError::invalid("bind_address", format!("Invalid address: {addr}")))?,
        );
        Ok(self)
    }

    /// Set heartbeat interval
    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = Some(secs);
        self
    }

    /// Set how many missed intervals make a worker stale
    pub fn stale_multiple(mut self, multiple: u32) -> Self {
        self.stale_multiple = Some(multiple);
        self
    }

    /// Enable/disable CORS
    pub fn enable_cors(mut self, enable: bool) -> Self {
        self.enable_cors = Some(enable);
        self
    }

    /// Enable/disable request logging
    pub fn enable_request_logging(mut self, enable: bool) -> Self {
        self.enable_request_logging = Some(enable);
        self
    }

    /// Set stats broadcast interval
    pub fn stats_interval_secs(mut self, secs: u64) -> Self {
        self.stats_interval_secs = Some(secs);
        self
    }

    /// Build the config
    pub fn build(self) -> Result<CoordinatorConfig, ConfigError> {
        let defaults = CoordinatorConfig::default();
        let config = CoordinatorConfig {
            bind_address: self.bind_address.unwrap_or(defaults.bind_address),
            heartbeat_interval_secs: self
                .heartbeat_interval_secs
                .unwrap_or(defaults.heartbeat_interval_secs),
            stale_multiple: self.stale_multiple.unwrap_or(defaults.stale_multiple),
            enable_cors: self.enable_cors.unwrap_or(defaults.enable_cors),
            enable_request_logging: self
                .enable_request_logging
                .unwrap_or(defaults.enable_request_logging),
            stats_interval_secs: self
                .stats_interval_secs
                .unwrap_or(defaults.stats_interval_secs),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address.port(), 8000);
        assert_eq!(config.stale_after(), Duration::from_secs(90));
    }

    #[test]
    fn test_config_builder() {
        let config = CoordinatorConfig::builder()
            .heartbeat_interval_secs(10)
            .stale_multiple(4)
            .stats_interval_secs(5)
            .build()
            .unwrap();

        assert_eq!(config.stale_after(), Duration::from_secs(40));
        assert_eq!(config.stats_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation_fails() {
        let result = CoordinatorConfig::builder().stale_multiple(1).build();
        assert!(result.is_err());

        let result = CoordinatorConfig::builder().heartbeat_interval_secs(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_builder_with_address() {
        let config = CoordinatorConfig::builder()
            .bind_address_str("127.0.0.1:9000")
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(config.bind_address.port(), 9000);
        assert!(CoordinatorConfig::builder().bind_address_str("nope").is_err());
    }
}

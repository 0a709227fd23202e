//! Configuration management for the coordinator service
//!
//! Configuration is loaded from environment variables or a TOML file and then
//! validated. Worker processes use [`crate::worker::WorkerConfig`] instead.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::coordination::CoordinationConfig;
use crate::coordinator::config::CoordinatorConfig;
use crate::storage::DatabaseConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Durable store connection
    pub database: DatabaseConfig,

    /// Coordination store connection
    pub coordination: CoordinationConfig,

    /// HTTP service settings
    pub server: CoordinatorConfig,

    /// Bearer authentication
    pub auth: AuthConfig,

    /// Lease and sweep settings
    pub lease: LeaseConfig,

    /// Ingestion settings
    pub ingest: IngestConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Bearer-token authentication; no secret disables the check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub api_secret: Option<String>,
}

/// Lease and reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease lifetime in seconds
    pub ttl_secs: u64,

    /// Interval between orphan sweeps in seconds
    pub sweep_interval_secs: u64,

    /// Oldest PENDING tasks considered per claim
    pub claim_lookahead: i64,

    /// Fail PROCESSING tasks older than this many seconds (disabled when unset)
    pub stale_task_after_secs: Option<u64>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            sweep_interval_secs: 60,
            claim_lookahead: 10,
            stale_task_after_secs: None,
        }
    }
}

impl LeaseConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub fn stale_task_after(&self) -> Option<Duration> {
        self.stale_task_after_secs.map(Duration::from_secs)
    }
}

/// Ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Host token a video URL must contain to be accepted
    pub expected_host: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            expected_host: "tiktok.com".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = LeaseConfig::default();

        let api_secret = std::env::var("API_SECRET").ok().filter(|s| !s.is_empty());

        let server = CoordinatorConfig::from_env()?;

        Ok(Self {
            database: DatabaseConfig::from_env(),
            coordination: CoordinationConfig::from_env(),
            server,
            auth: AuthConfig { api_secret },
            lease: LeaseConfig {
                ttl_secs: env_parse("LEASE_TTL_SECS").unwrap_or(defaults.ttl_secs),
                sweep_interval_secs: env_parse("SWEEP_INTERVAL_SECS")
                    .unwrap_or(defaults.sweep_interval_secs),
                claim_lookahead: env_parse("CLAIM_LOOKAHEAD").unwrap_or(defaults.claim_lookahead),
                stale_task_after_secs: env_parse("STALE_TASK_AFTER_SECS"),
            },
            ingest: IngestConfig {
                expected_host: std::env::var("EXPECTED_HOST")
                    .unwrap_or_else(|_| IngestConfig::default().expected_host),
            },
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| String::from("info")),
                format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| String::from("text")),
            },
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease.ttl_secs == 0 {
            return Err(ConfigError::invalid("lease.ttl_secs", "must be greater than 0"));
        }
        if self.lease.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "lease.sweep_interval_secs",
                "must be greater than 0",
            ));
        }
        if self.lease.claim_lookahead <= 0 {
            return Err(ConfigError::invalid(
                "lease.claim_lookahead",
                "must be greater than 0",
            ));
        }
        if self.lease.stale_task_after_secs == Some(0) {
            return Err(ConfigError::invalid(
                "lease.stale_task_after_secs",
                "must be greater than 0 when set",
            ));
        }
        if self.database.pool_size == 0 {
            return Err(ConfigError::invalid("database.pool_size", "must be greater than 0"));
        }
        if self.coordination.pool_size == 0 {
            return Err(ConfigError::invalid(
                "coordination.pool_size",
                "must be greater than 0",
            ));
        }
        if self.ingest.expected_host.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "ingest.expected_host".to_string(),
            });
        }
        self.server.validate()?;
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease.ttl(), Duration::from_secs(600));
        assert_eq!(config.lease.claim_lookahead, 10);
        assert!(config.lease.stale_task_after().is_none());
        assert!(config.auth.api_secret.is_none());
    }

    #[test]
    fn test_invalid_lease_ttl() {
        let mut config = Config::default();
        config.lease.ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_stale_bound_rejected() {
        let mut config = Config::default();
        config.lease.stale_task_after_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[lease]
ttl_secs = 120
stale_task_after_secs = 3600

[auth]
api_secret = "s3cret"

[ingest]
expected_host = "example.com"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.lease.ttl_secs, 120);
        assert_eq!(config.lease.sweep_interval_secs, 60);
        assert_eq!(config.lease.stale_task_after_secs, Some(3600));
        assert_eq!(config.auth.api_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.ingest.expected_host, "example.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file(Path::new("/nonexistent/scrapefleet.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_reads_lease_settings() {
        std::env::set_var("LEASE_TTL_SECS", "900");
        std::env::set_var("STALE_TASK_AFTER_SECS", "7200");
        std::env::set_var("API_SECRET", "");

        let config = Config::from_env().unwrap();
        assert_eq!(config.lease.ttl_secs, 900);
        assert_eq!(config.lease.stale_task_after_secs, Some(7200));
        assert!(config.auth.api_secret.is_none());

        std::env::remove_var("LEASE_TTL_SECS");
        std::env::remove_var("STALE_TASK_AFTER_SECS");
        std::env::remove_var("API_SECRET");
    }
}

//! Worker process configuration
//!
//! Loaded from environment variables; see [`WorkerConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::config::ConfigError;
use crate::coordination::CoordinationConfig;

/// Configuration for one worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Display name; also the key of the worker's control channel
    pub name: String,

    /// Host reported at registration
    pub host: String,

    /// Coordinator base URL
    pub coordinator_url: String,

    /// Coordination store (commands, lifecycle, status)
    pub coordination: CoordinationConfig,

    /// Bearer secret for the coordinator API
    #[serde(skip_serializing)]
    pub api_secret: Option<String>,

    /// Tasks processed concurrently
    pub max_concurrent_tasks: usize,

    /// Pause between claim attempts in seconds
    pub poll_interval_secs: u64,

    /// Status snapshot interval in seconds
    pub heartbeat_interval_secs: u64,

    /// Registration retry interval in seconds
    pub registration_retry_secs: u64,

    /// External scraper, program followed by arguments
    pub scraper_command: String,

    /// Kill the scraper after this many seconds (no bound when unset)
    pub task_timeout_secs: Option<u64>,

    /// Enter RUNNING right after start instead of waiting for `start`
    pub auto_start: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker-1".to_string(),
            host: "localhost".to_string(),
            coordinator_url: "http://localhost:8000".to_string(),
            coordination: CoordinationConfig::default(),
            api_secret: None,
            max_concurrent_tasks: 1,
            poll_interval_secs: 5,
            heartbeat_interval_secs: 30,
            registration_retry_secs: 30,
            scraper_command: "scraper".to_string(),
            task_timeout_secs: None,
            auto_start: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKER_NAME`: display name [default: `HOSTNAME`, else worker-1]
    /// - `WORKER_HOST`: reported host [default: `HOSTNAME`, else localhost]
    /// - `COORDINATOR_URL`: coordinator base URL [default: http://localhost:8000]
    /// - `REDIS_URL`, `REDIS_POOL_SIZE`: coordination store
    /// - `API_SECRET`: bearer secret [optional]
    /// - `MAX_CONCURRENT_TASKS` [default: 1]
    /// - `POLL_INTERVAL_SECS` [default: 5]
    /// - `HEARTBEAT_INTERVAL_SECS` [default: 30]
    /// - `REGISTRATION_RETRY_SECS` [default: 30]
    /// - `SCRAPER_COMMAND` [default: scraper]
    /// - `TASK_TIMEOUT_SECS` [optional]
    /// - `AUTO_START` [default: true]
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let hostname = env::var("HOSTNAME").ok().filter(|h| !h.trim().is_empty());

        let config = Self {
            name: env::var("WORKER_NAME")
                .ok()
                .or_else(|| hostname.clone())
                .unwrap_or(defaults.name),
            host: env::var("WORKER_HOST")
                .ok()
                .or(hostname)
                .unwrap_or(defaults.host),
            coordinator_url: env::var("COORDINATOR_URL").unwrap_or(defaults.coordinator_url),
            coordination: CoordinationConfig::from_env(),
            api_secret: env::var("API_SECRET").ok().filter(|s| !s.is_empty()),
            max_concurrent_tasks: env_parse("MAX_CONCURRENT_TASKS")
                .unwrap_or(defaults.max_concurrent_tasks),
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS")
                .unwrap_or(defaults.poll_interval_secs),
            heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL_SECS")
                .unwrap_or(defaults.heartbeat_interval_secs),
            registration_retry_secs: env_parse("REGISTRATION_RETRY_SECS")
                .unwrap_or(defaults.registration_retry_secs),
            scraper_command: env::var("SCRAPER_COMMAND").unwrap_or(defaults.scraper_command),
            task_timeout_secs: env_parse("TASK_TIMEOUT_SECS"),
            auto_start: env_flag("AUTO_START").unwrap_or(defaults.auto_start),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "WORKER_NAME".to_string(),
            });
        }
        if url::Url::parse(&self.coordinator_url).is_err() {
            return Err(ConfigError::invalid(
                "COORDINATOR_URL",
                format!("not a valid URL: {}", self.coordinator_url),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::invalid("MAX_CONCURRENT_TASKS", "must be at least 1"));
        }
        for (field, value) in [
            ("POLL_INTERVAL_SECS", self.poll_interval_secs),
            ("HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval_secs),
            ("REGISTRATION_RETRY_SECS", self.registration_retry_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than 0"));
            }
        }
        if self.scraper_command.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "SCRAPER_COMMAND".to_string(),
            });
        }
        if self.task_timeout_secs == Some(0) {
            return Err(ConfigError::invalid(
                "TASK_TIMEOUT_SECS",
                "must be greater than 0 when set",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn registration_retry(&self) -> Duration {
        Duration::from_secs(self.registration_retry_secs)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    /// Display configuration (secret masked)
    pub fn display(&self) -> String {
        format!(
            "Worker Configuration\n\
             {:-<50}\n\
             Name: {}\n\
             Host: {}\n\
             Coordinator: {}\n\
             API Secret: {}\n\
             Max Concurrent Tasks: {}\n\
             Poll Interval: {}s\n\
             Heartbeat Interval: {}s\n\
             Scraper: {}\n\
             Task Timeout: {}\n\
             Auto Start: {}",
            "",
            self.name,
            self.host,
            self.coordinator_url,
            if self.api_secret.is_some() { "***" } else { "(none)" },
            self.max_concurrent_tasks,
            self.poll_interval_secs,
            self.heartbeat_interval_secs,
            self.scraper_command,
            self.task_timeout_secs
                .map(|s| format!("{s}s"))
                .unwrap_or_else(|| "none".to_string()),
            self.auto_start,
        )
    }
}

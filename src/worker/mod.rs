//! Worker process
//!
//! A worker claims tasks from the coordinator, runs the external scraper and
//! submits its raw output. It is steered over the coordination store:
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!                 │              Worker                  │
//!   coordinator ◄─┤ register / claim / results / fail    │
//!     (HTTP)      │                                      │
//!                 │ poll loop ──► scraper (child process)│
//!                 │                                      │
//!   redis ───────►│ worker:<name>:control  commands      │
//!   redis ───────►│ worker:updates         deletion      │
//!   redis ◄───────┤ worker:status          snapshots     │
//!                 └──────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use scrapefleet::worker::{WorkerConfig, WorkerRunner};
//!
//! let config = WorkerConfig::from_env()?;
//! let coordination = Arc::new(RedisCoordination::connect(&config.coordination).await?);
//! let runner = WorkerRunner::new(config, coordination)?;
//! runner.run().await?;
//! ```

pub mod config;
pub mod runner;
pub mod scraper;
pub mod state;

pub use config::WorkerConfig;
pub use runner::{RunSummary, WorkerRunner};
pub use scraper::{ScraperCommand, ScraperError, ScraperOutput};
pub use state::{CommandEffect, WorkerState};

use thiserror::Error;

use crate::config::ConfigError;
use crate::coordination::CoordinationError;
use crate::coordinator::client::ClientError;
use crate::error::{ErrorCategory, FleetErrorTrait};

/// Errors that stop a worker from starting
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid worker configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("coordination store unavailable: {0}")]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Scraper(#[from] ScraperError),
}

impl FleetErrorTrait for RunnerError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Client(e) => e.is_recoverable(),
            Self::Coordination(e) => e.is_recoverable(),
            Self::Config(_) | Self::Scraper(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::Scraper(_) => ErrorCategory::Config,
            Self::Client(e) => e.category(),
            Self::Coordination(_) => ErrorCategory::ControlPlane,
        }
    }
}

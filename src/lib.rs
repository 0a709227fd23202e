//! scrapefleet - distributed scraping task coordination
//!
//! A coordinator hands scraping tasks to a fleet of worker processes, ingests
//! the raw output they return and fans out live updates.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Coordinator configuration
//! - [`models`] - Tasks, workers, results and their status vocabularies
//! - [`storage`] - Durable state (PostgreSQL, in-memory)
//! - [`coordination`] - Leases and pub/sub (Redis, in-memory)
//! - [`lock`] - Lease-based task claiming and the orphan sweep
//! - [`control`] - Worker registry, commands and liveness
//! - [`ingest`] - Scraper output extraction, cleaning and persistence
//! - [`events`] - Live-update fan-out
//! - [`coordinator`] - HTTP API, server and worker-side client
//! - [`worker`] - Worker process runtime
//! - [`metrics`] - Prometheus metrics
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scrapefleet::config::Config;
//! use scrapefleet::coordination::MemoryCoordination;
//! use scrapefleet::coordinator::CoordinatorServer;
//! use scrapefleet::storage::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let server = CoordinatorServer::new(
//!         &config,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryCoordination::new()),
//!     )?;
//!     server.start_with_shutdown(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod coordination;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ingest;
pub mod lock;
pub mod metrics;
pub mod models;
pub mod storage;
pub mod utils;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::control::{ControlAction, ControlPlane};
    pub use crate::coordination::{CoordinationStore, SharedCoordination};
    pub use crate::coordinator::{CoordinatorClient, CoordinatorServer};
    pub use crate::error::{Error, ErrorCategory, FleetErrorTrait, Result};
    pub use crate::ingest::IngestionPipeline;
    pub use crate::lock::TaskLockManager;
    pub use crate::models::{ScrapeResult, Task, TaskStatus, Worker, WorkerStatus};
    pub use crate::storage::{SharedStateStore, StateStore};
    pub use crate::worker::{WorkerConfig, WorkerRunner};
}

// Direct re-exports for convenience
pub use models::{ScrapeResult, Task, TaskKind, TaskStatus, Worker, WorkerStatus};

//! Durable state store
//!
//! Relational storage for tasks, workers and results. Business logic talks to
//! the [`StateStore`] trait; PostgreSQL backs production and an in-memory
//! implementation backs tests and local development.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │     TaskLockManager · ControlPlane · IngestionPipeline      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StateStore (trait)                       │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//!      ┌─────────────────────┐        ┌─────────────────────┐
//!      │   PostgresStore     │        │    MemoryStore      │
//!      │ (deadpool-postgres) │        │                     │
//!      └─────────────────────┘        └─────────────────────┘
//! ```
//!
//! Conditional writes (`mark_processing`, `finish_task`) return `Ok(None)`
//! when their precondition no longer holds. That outcome is contention, not
//! an error.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::models::{
    Heartbeat, PersistOutcome, ScrapeResult, SystemStats, Task, TaskProgress, TaskStatus,
    VideoDraft, Worker, WorkerUpdate,
};

pub use memory::MemoryStore;
pub use postgres::{DatabaseConfig, PostgresStore};

// ============================================================================
// Query types
// ============================================================================

/// Filter for listing tasks (newest first)
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Final state a PROCESSING task moves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Completed with the number of persisted videos
    Completed { videos: i32 },
    /// Failed with a human-readable reason
    Failed { error: String },
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed { .. } => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            TaskOutcome::Completed { .. } => None,
            TaskOutcome::Failed { error } => Some(error),
        }
    }

    pub fn videos(&self) -> Option<i32> {
        match self {
            TaskOutcome::Completed { videos } => Some(*videos),
            TaskOutcome::Failed { .. } => None,
        }
    }
}

/// Default page size for list endpoints
pub const DEFAULT_PAGE_SIZE: i64 = 100;

// ============================================================================
// Store trait
// ============================================================================

#[async_trait]
pub trait StateStore: Send + Sync {
    // --- tasks -------------------------------------------------------------

    async fn create_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Update progress counters of a task. Errors with `NotFound` if absent.
    async fn update_task_progress(
        &self,
        id: Uuid,
        progress: &TaskProgress,
    ) -> Result<Task, StoreError>;

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Up to `limit` oldest PENDING tasks ordered by arrival
    async fn pending_candidates(&self, limit: i64) -> Result<Vec<Task>, StoreError>;

    /// PENDING -> PROCESSING, only if still PENDING
    async fn mark_processing(
        &self,
        id: Uuid,
        worker_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// PROCESSING -> COMPLETED/FAILED, only if still PROCESSING and, when
    /// `expected_worker` is given, still assigned to that worker
    async fn finish_task(
        &self,
        id: Uuid,
        outcome: &TaskOutcome,
        expected_worker: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    async fn task_status(&self, id: Uuid) -> Result<Option<TaskStatus>, StoreError>;

    /// PROCESSING tasks whose `started_at` is older than `started_before`
    async fn stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError>;

    // --- workers -----------------------------------------------------------

    /// Insert a worker or, when the name is already registered, reset it and
    /// keep its durable id
    async fn register_worker(&self, name: &str, host: &str) -> Result<Worker, StoreError>;

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, StoreError>;

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError>;

    async fn update_worker(
        &self,
        id: Uuid,
        update: &WorkerUpdate,
    ) -> Result<Option<Worker>, StoreError>;

    /// Persist liveness data; returns false if the worker row is gone
    async fn record_heartbeat(&self, id: Uuid, heartbeat: &Heartbeat)
        -> Result<bool, StoreError>;

    /// Remove a worker, returning the deleted row
    async fn delete_worker(&self, id: Uuid) -> Result<Option<Worker>, StoreError>;

    // --- results -----------------------------------------------------------

    /// Atomically insert one Result and all its VideoRecord children for a
    /// task. If the task already has a result, that result is returned
    /// unchanged with `created = false`.
    async fn persist_result(
        &self,
        task_id: Uuid,
        drafts: Vec<VideoDraft>,
    ) -> Result<PersistOutcome, StoreError>;

    async fn get_result(&self, id: Uuid) -> Result<Option<ScrapeResult>, StoreError>;

    async fn list_results(&self, limit: i64, offset: i64)
        -> Result<Vec<ScrapeResult>, StoreError>;

    // --- misc --------------------------------------------------------------

    /// Aggregate counts; workers with no activity since `stale_before` are stale
    async fn stats(&self, stale_before: DateTime<Utc>) -> Result<SystemStats, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Shared, dynamically dispatched store handle
pub type SharedStateStore = Arc<dyn StateStore>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid data: {0}")]
    Corrupt(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Self::Pool(e.to_string())
    }
}

impl FleetErrorTrait for StoreError {
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Database(_) | Self::Injected(_))
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Persistence
    }
}

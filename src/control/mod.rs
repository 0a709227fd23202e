//! Worker control plane
//!
//! Coordinator-side half of the worker protocol:
//!
//! ```text
//!  operator ── send_control ──► worker:<name>:control   {action, timestamp}
//!  operator ── delete_worker ─► worker:updates          {type:"worker", action:"delete", data:{id}}
//!                            └► worker:<name>:control   {action:"shutdown"}
//!  workers  ── heartbeat ─────► worker:status           StatusSnapshot
//!                                   │
//!                                   └──► status listener ──► record_heartbeat
//! ```
//!
//! Commands are fire-and-forget. Liveness is advisory: a worker that misses
//! heartbeats is reported stale, nothing is reassigned.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::coordination::{
    control_channel, CoordinationError, SharedCoordination, WORKER_STATUS_CHANNEL,
};
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::events::{DomainEvent, EventAction, EventPublisher};
use crate::metrics;
use crate::models::{Heartbeat, ParseEnumError, Worker, WorkerStatus, WorkerUpdate};
use crate::storage::{SharedStateStore, StoreError};

// ============================================================================
// Wire types
// ============================================================================

/// Command delivered on a worker's control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Pause,
    Stop,
    Shutdown,
    Status,
}

impl ControlAction {
    pub const ALL: [ControlAction; 5] = [
        ControlAction::Start,
        ControlAction::Pause,
        ControlAction::Stop,
        ControlAction::Shutdown,
        ControlAction::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
            Self::Status => "status",
        }
    }
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError::new("control action", s))
    }
}

/// Payload on `worker:<name>:control`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub timestamp: DateTime<Utc>,
}

impl ControlMessage {
    pub fn new(action: ControlAction) -> Self {
        Self {
            action,
            timestamp: Utc::now(),
        }
    }
}

/// Process resource usage reported with each snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resident set size, when the platform exposes it
    pub rss_bytes: Option<u64>,
    /// Scraper processes currently running
    pub active_scrapers: usize,
}

/// Payload on `worker:status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Durable id; absent while the worker is unregistered
    pub worker_id: Option<Uuid>,
    pub name: String,
    pub host: String,
    pub status: WorkerStatus,
    pub in_flight: Vec<Uuid>,
    pub processed_count: i64,
    pub uptime_secs: u64,
    #[serde(default)]
    pub resources: ResourceUsage,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn to_heartbeat(&self) -> Heartbeat {
        Heartbeat {
            status: self.status,
            processed_count: self.processed_count,
            current_task_id: self.in_flight.first().copied(),
            error_message: self.error_message.clone(),
            at: self.timestamp,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker not found: {0}")]
    WorkerNotFound(Uuid),

    #[error("an error message is required when setting status ERROR")]
    MissingErrorMessage,

    #[error("invalid worker {field}: must not be empty")]
    EmptyField { field: &'static str },
}

impl FleetErrorTrait for ControlError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Coordination(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            _ => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Coordination(_) => ErrorCategory::ControlPlane,
            Self::Store(e) => e.category(),
            Self::WorkerNotFound(_) => ErrorCategory::Persistence,
            Self::MissingErrorMessage | Self::EmptyField { .. } => ErrorCategory::Config,
        }
    }
}

// ============================================================================
// Control plane
// ============================================================================

pub struct ControlPlane {
    store: SharedStateStore,
    coordination: SharedCoordination,
    events: EventPublisher,
}

impl ControlPlane {
    pub fn new(
        store: SharedStateStore,
        coordination: SharedCoordination,
        events: EventPublisher,
    ) -> Self {
        Self {
            store,
            coordination,
            events,
        }
    }

    /// Register a worker by display name. Re-registering a known name
    /// returns the existing durable id.
    pub async fn register_worker(&self, name: &str, host: &str) -> Result<Worker, ControlError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ControlError::EmptyField { field: "name" });
        }

        let worker = self.store.register_worker(name, host.trim()).await?;
        tracing::info!(worker_id = %worker.id, name = %worker.name, host = %worker.host, "Worker registered");
        self.events.worker(EventAction::Register, &worker).await;
        Ok(worker)
    }

    /// Publish a command on the worker's control channel.
    ///
    /// Returns the number of subscribers that received it; zero means the
    /// worker is offline or not yet listening.
    pub async fn send_control(
        &self,
        worker_id: Uuid,
        action: ControlAction,
    ) -> Result<usize, ControlError> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or(ControlError::WorkerNotFound(worker_id))?;

        let payload = serde_json::to_string(&ControlMessage::new(action))
            .map_err(CoordinationError::from)?;
        let receivers = self
            .coordination
            .publish(&control_channel(&worker.name), &payload)
            .await?;

        metrics::record_control_command(action.as_str());
        tracing::info!(worker = %worker.name, action = %action, receivers, "Control command sent");
        Ok(receivers)
    }

    /// Apply a status/counter update from a worker or operator
    pub async fn update_worker(
        &self,
        worker_id: Uuid,
        update: &WorkerUpdate,
    ) -> Result<Worker, ControlError> {
        let has_message = update
            .error_message
            .as_deref()
            .is_some_and(|m| !m.trim().is_empty());
        if update.status == Some(WorkerStatus::Error) && !has_message {
            return Err(ControlError::MissingErrorMessage);
        }

        let worker = self
            .store
            .update_worker(worker_id, update)
            .await?
            .ok_or(ControlError::WorkerNotFound(worker_id))?;

        self.events.worker(EventAction::Update, &worker).await;
        Ok(worker)
    }

    /// Delete the row, then tell the physical worker to go away.
    ///
    /// Exactly one lifecycle event and one shutdown command are published.
    /// Publish failures are logged and do not undo the deletion.
    pub async fn delete_worker(&self, worker_id: Uuid) -> Result<Worker, ControlError> {
        let worker = self
            .store
            .delete_worker(worker_id)
            .await?
            .ok_or(ControlError::WorkerNotFound(worker_id))?;

        tracing::info!(worker_id = %worker.id, name = %worker.name, "Worker deleted");

        if let Err(e) = self
            .events
            .publish(&DomainEvent::worker_deleted(worker.id, &worker.name))
            .await
        {
            tracing::warn!(worker = %worker.name, error = %e, "Lifecycle delete broadcast failed");
        }

        let shutdown = serde_json::to_string(&ControlMessage::new(ControlAction::Shutdown));
        let published = match shutdown {
            Ok(payload) => self
                .coordination
                .publish(&control_channel(&worker.name), &payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match published {
            Ok(_) => metrics::record_control_command(ControlAction::Shutdown.as_str()),
            Err(e) => {
                tracing::warn!(worker = %worker.name, error = %e, "Shutdown command publish failed")
            }
        }

        Ok(worker)
    }

    /// Persist liveness data from one snapshot.
    ///
    /// Snapshots from unregistered or deleted workers are ignored.
    pub async fn record_snapshot(&self, snapshot: &StatusSnapshot) -> Result<bool, ControlError> {
        let Some(worker_id) = snapshot.worker_id else {
            return Ok(false);
        };
        let stored = self
            .store
            .record_heartbeat(worker_id, &snapshot.to_heartbeat())
            .await?;
        if stored {
            metrics::record_heartbeat();
        } else {
            tracing::debug!(worker_id = %worker_id, "Heartbeat for unknown worker ignored");
        }
        Ok(stored)
    }

    /// Consume `worker:status` and persist every snapshot until shutdown
    pub async fn spawn_status_listener(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ControlError> {
        let mut sub = self
            .coordination
            .subscribe(&[WORKER_STATUS_CHANNEL.to_string()])
            .await?;

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = sub.recv() => {
                        let Some(msg) = msg else {
                            tracing::warn!("Status subscription closed");
                            break;
                        };
                        match serde_json::from_str::<StatusSnapshot>(&msg.payload) {
                            Ok(snapshot) => {
                                if let Err(e) = self.record_snapshot(&snapshot).await {
                                    metrics::record_heartbeat_error();
                                    tracing::warn!(worker = %snapshot.name, error = %e, "Failed to persist heartbeat");
                                }
                            }
                            Err(e) => {
                                metrics::record_heartbeat_error();
                                tracing::warn!(error = %e, "Undecodable status snapshot");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }))
    }

    /// Workers with no activity within `stale_after`
    pub async fn stale_workers(&self, stale_after: Duration) -> Result<Vec<Worker>, ControlError> {
        let threshold = stale_threshold(stale_after);
        Ok(self
            .store
            .list_workers()
            .await?
            .into_iter()
            .filter(|w| w.is_stale(threshold))
            .collect())
    }

    /// Periodically report stale workers and refresh worker gauges
    pub fn spawn_stale_monitor(
        self: Arc<Self>,
        stale_after: Duration,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut reported: Vec<Uuid> = Vec::new();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let (workers, stale) = match self.store.list_workers().await {
                            Ok(workers) => {
                                let threshold = stale_threshold(stale_after);
                                let stale: Vec<Uuid> = workers
                                    .iter()
                                    .filter(|w| w.is_stale(threshold))
                                    .map(|w| w.id)
                                    .collect();
                                (workers, stale)
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Stale worker check failed");
                                continue;
                            }
                        };

                        for worker in workers.iter().filter(|w| stale.contains(&w.id) && !reported.contains(&w.id)) {
                            tracing::warn!(
                                worker = %worker.name,
                                last_activity = %worker.last_activity,
                                "Worker missed heartbeats"
                            );
                        }
                        metrics::update_worker_gauges(workers.len() as u64, stale.len() as u64);
                        reported = stale;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn stale_threshold(stale_after: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero())
}

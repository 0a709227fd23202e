//! Task lock manager
//!
//! Exclusive task claiming built from two independent checks:
//!
//! ```text
//!  claim_next(worker)
//!      │
//!      ├─► pending_candidates(N) ── oldest PENDING first
//!      │
//!      └─► for each candidate
//!            ├─ SET lock:<id> <token> NX EX ttl ── held? ─► next candidate
//!            ├─ UPDATE .. WHERE status='PENDING' ── lost? ─► DEL lock, next
//!            └─ return task (PROCESSING, started_at set)
//! ```
//!
//! The sweep deletes every lease whose task is not PROCESSING. A crash
//! between the two claim steps therefore leaves at most one stray lease,
//! repaired by the sweep or by TTL expiry. The task row itself stays
//! PENDING and is reclaimed normally.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::LeaseConfig;
use crate::coordination::{
    lease_key, task_id_from_lease_key, CoordinationError, SharedCoordination, LEASE_PREFIX,
};
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::events::{EventAction, EventPublisher};
use crate::metrics::{self, ClaimOutcome};
use crate::models::{Task, TaskStatus};
use crate::storage::{SharedStateStore, StoreError, TaskOutcome};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum LockError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("task {id} is {status}, expected PROCESSING")]
    InvalidState { id: Uuid, status: TaskStatus },

    #[error("task {id} is not assigned to worker {worker_id}")]
    NotAssigned { id: Uuid, worker_id: Uuid },
}

impl FleetErrorTrait for LockError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Coordination(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            _ => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Coordination(e) => e.category(),
            Self::Store(e) => e.category(),
            Self::TaskNotFound(_) => ErrorCategory::Persistence,
            Self::InvalidState { .. } | Self::NotAssigned { .. } => ErrorCategory::Contention,
        }
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Leases deleted because their task was not PROCESSING
    pub repaired: usize,
    /// PROCESSING tasks failed for exceeding the processing bound
    pub stale_failed: usize,
}

// ============================================================================
// Lock manager
// ============================================================================

pub struct TaskLockManager {
    store: SharedStateStore,
    coordination: SharedCoordination,
    events: EventPublisher,
    config: LeaseConfig,
}

impl TaskLockManager {
    pub fn new(
        store: SharedStateStore,
        coordination: SharedCoordination,
        events: EventPublisher,
        config: LeaseConfig,
    ) -> Self {
        Self {
            store,
            coordination,
            events,
            config,
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Claim the oldest PENDING task whose lease is free.
    ///
    /// Returns `Ok(None)` when every candidate is taken or none exist.
    /// Contention is never surfaced as an error.
    pub async fn claim_next(&self, worker_id: Option<Uuid>) -> Result<Option<Task>, LockError> {
        let candidates = self
            .store
            .pending_candidates(self.config.claim_lookahead)
            .await?;

        if candidates.is_empty() {
            metrics::record_claim(ClaimOutcome::Empty);
            return Ok(None);
        }

        let mut lost_race = false;
        for candidate in candidates {
            let key = lease_key(candidate.id);
            let token = claimant_token(worker_id);

            if !self
                .coordination
                .set_nx_ex(&key, &token, self.config.ttl())
                .await?
            {
                tracing::debug!(task_id = %candidate.id, "Lease held elsewhere, skipping");
                continue;
            }

            let claimed = match self
                .store
                .mark_processing(candidate.id, worker_id, Utc::now())
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    self.release_quietly(candidate.id).await;
                    return Err(e.into());
                }
            };

            match claimed {
                Some(task) => {
                    tracing::info!(
                        task_id = %task.id,
                        worker_id = ?worker_id,
                        url = %task.url,
                        "Task claimed"
                    );
                    metrics::record_claim(ClaimOutcome::Claimed);
                    self.events.task(EventAction::Claim, &task).await;
                    return Ok(Some(task));
                }
                None => {
                    tracing::debug!(task_id = %candidate.id, "Task left PENDING before claim");
                    lost_race = true;
                    self.release_quietly(candidate.id).await;
                }
            }
        }

        metrics::record_claim(if lost_race {
            ClaimOutcome::LostRace
        } else {
            ClaimOutcome::Contended
        });
        Ok(None)
    }

    /// Delete a task's lease. Idempotent.
    pub async fn release_lease(&self, task_id: Uuid) -> Result<bool, LockError> {
        Ok(self.coordination.delete(&lease_key(task_id)).await?)
    }

    async fn release_quietly(&self, task_id: Uuid) {
        if let Err(e) = self.release_lease(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "Lease release failed, sweep will repair");
        }
    }

    /// PROCESSING -> COMPLETED, then release the lease
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: Option<Uuid>,
        videos: i32,
    ) -> Result<Task, LockError> {
        self.finish(task_id, worker_id, TaskOutcome::Completed { videos })
            .await
    }

    /// PROCESSING -> FAILED with a reason, then release the lease
    pub async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: Option<Uuid>,
        error: impl Into<String>,
    ) -> Result<Task, LockError> {
        self.finish(
            task_id,
            worker_id,
            TaskOutcome::Failed {
                error: error.into(),
            },
        )
        .await
    }

    async fn finish(
        &self,
        task_id: Uuid,
        worker_id: Option<Uuid>,
        outcome: TaskOutcome,
    ) -> Result<Task, LockError> {
        let finished = self
            .store
            .finish_task(task_id, &outcome, worker_id, Utc::now())
            .await?;

        let Some(task) = finished else {
            return Err(self.explain_rejected_finish(task_id, worker_id).await?);
        };

        self.release_quietly(task_id).await;

        let action = match outcome {
            TaskOutcome::Completed { .. } => EventAction::Complete,
            TaskOutcome::Failed { .. } => EventAction::Fail,
        };
        tracing::info!(
            task_id = %task_id,
            status = %task.status,
            error = ?task.error,
            "Task finished"
        );
        self.events.task(action, &task).await;

        Ok(task)
    }

    async fn explain_rejected_finish(
        &self,
        task_id: Uuid,
        worker_id: Option<Uuid>,
    ) -> Result<LockError, LockError> {
        match self.store.get_task(task_id).await? {
            None => Ok(LockError::TaskNotFound(task_id)),
            Some(task) if task.status != TaskStatus::Processing => Ok(LockError::InvalidState {
                id: task_id,
                status: task.status,
            }),
            Some(_) => Ok(LockError::NotAssigned {
                id: task_id,
                worker_id: worker_id.unwrap_or_default(),
            }),
        }
    }

    /// Delete every lease whose task is not currently PROCESSING.
    ///
    /// Returns the number of leases removed.
    pub async fn sweep_orphans(&self) -> Result<usize, LockError> {
        let keys = self.coordination.keys_with_prefix(LEASE_PREFIX).await?;
        let mut repaired = 0;

        for key in keys {
            let status = match task_id_from_lease_key(&key) {
                Some(task_id) => match self.store.task_status(task_id).await {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Skipping lease, status lookup failed");
                        continue;
                    }
                },
                None => None,
            };

            if status == Some(TaskStatus::Processing) {
                continue;
            }

            match self.coordination.delete(&key).await {
                Ok(true) => {
                    tracing::info!(key = %key, status = ?status, "Removed orphan lease");
                    repaired += 1;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to remove orphan lease"),
            }
        }

        Ok(repaired)
    }

    /// Fail PROCESSING tasks older than the configured bound.
    ///
    /// No-op unless `stale_task_after_secs` is set.
    pub async fn expire_stale_tasks(&self) -> Result<usize, LockError> {
        let Some(bound) = self.config.stale_task_after() else {
            return Ok(0);
        };
        let Ok(bound_delta) = chrono::Duration::from_std(bound) else {
            return Ok(0);
        };

        let cutoff = Utc::now() - bound_delta;
        let stale = self.store.stale_processing(cutoff).await?;
        let mut failed = 0;

        for task in stale {
            let reason = format!("task exceeded {}s processing bound", bound.as_secs());
            match self.fail_task(task.id, None, reason).await {
                Ok(_) => {
                    tracing::warn!(task_id = %task.id, worker_id = ?task.worker_id, "Failed stale task");
                    failed += 1;
                }
                // finished concurrently
                Err(LockError::InvalidState { .. } | LockError::TaskNotFound(_)) => {}
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "Failed to expire stale task"),
            }
        }

        Ok(failed)
    }

    /// One reconciliation pass: orphan leases, then stale tasks
    pub async fn run_sweep(&self) -> Result<SweepReport, LockError> {
        let stale_failed = self.expire_stale_tasks().await?;
        let repaired = self.sweep_orphans().await?;
        metrics::record_sweep(repaired, stale_failed);

        if repaired > 0 || stale_failed > 0 {
            tracing::info!(repaired, stale_failed, "Sweep finished");
        }
        Ok(SweepReport {
            repaired,
            stale_failed,
        })
    }

    /// Run the sweep on its own timer until shutdown is signalled
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_sweep().await {
                            tracing::error!(error = %e, "Orphan sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("Sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// Opaque lease value: claimant plus a fresh random component
fn claimant_token(worker_id: Option<Uuid>) -> String {
    match worker_id {
        Some(id) => format!("{id}:{}", Uuid::new_v4().simple()),
        None => format!("anonymous:{}", Uuid::new_v4().simple()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationStore, MemoryCoordination};
    use crate::models::TaskKind;
    use crate::storage::{MemoryStore, StateStore};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        coordination: Arc<MemoryCoordination>,
        manager: TaskLockManager,
    }

    fn fixture(config: LeaseConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let coordination = Arc::new(MemoryCoordination::new());
        let manager = TaskLockManager::new(
            store.clone(),
            coordination.clone(),
            EventPublisher::new(coordination.clone()),
            config,
        );
        Fixture {
            store,
            coordination,
            manager,
        }
    }

    async fn add_task(store: &MemoryStore, handle: &str) -> Task {
        let task = Task::new(format!("https://www.tiktok.com/@{handle}"), TaskKind::Profile);
        store.create_task(&task).await.unwrap();
        task
    }

    #[test]
    fn test_claimant_tokens_are_unique() {
        let id = Uuid::new_v4();
        assert_ne!(claimant_token(Some(id)), claimant_token(Some(id)));
        assert!(claimant_token(None).starts_with("anonymous:"));
    }

    #[tokio::test]
    async fn test_claim_skips_held_lease() {
        let f = fixture(LeaseConfig::default());
        let first = add_task(&f.store, "a").await;
        let second = add_task(&f.store, "b").await;

        f.coordination
            .insert_raw(&lease_key(first.id), "someone", Duration::from_secs(60))
            .await;

        let claimed = f.manager.claim_next(None).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
    }

    #[tokio::test]
    async fn test_claim_ignores_rows_advanced_elsewhere() {
        let f = fixture(LeaseConfig::default());
        let task = add_task(&f.store, "a").await;

        f.store
            .mark_processing(task.id, None, Utc::now())
            .await
            .unwrap();
        assert!(f.manager.claim_next(None).await.unwrap().is_none());
        assert!(f.coordination.get(&lease_key(task.id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_requires_processing() {
        let f = fixture(LeaseConfig::default());
        let task = add_task(&f.store, "a").await;

        let err = f.manager.fail_task(task.id, None, "boom").await.unwrap_err();
        assert!(matches!(
            err,
            LockError::InvalidState {
                status: TaskStatus::Pending,
                ..
            }
        ));

        let err = f
            .manager
            .fail_task(Uuid::new_v4(), None, "boom")
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_finish_rejects_other_worker() {
        let f = fixture(LeaseConfig::default());
        add_task(&f.store, "a").await;
        let owner = Uuid::new_v4();

        let task = f.manager.claim_next(Some(owner)).await.unwrap().unwrap();
        let err = f
            .manager
            .complete_task(task.id, Some(Uuid::new_v4()), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::NotAssigned { .. }));
        assert_eq!(err.category(), ErrorCategory::Contention);

        let done = f.manager.complete_task(task.id, Some(owner), 3).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.videos_processed, 3);
    }

    #[tokio::test]
    async fn test_malformed_lease_key_is_swept() {
        let f = fixture(LeaseConfig::default());
        f.coordination
            .insert_raw("lock:garbage", "x", Duration::from_secs(60))
            .await;

        assert_eq!(f.manager.sweep_orphans().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_tasks_expire_only_when_configured() {
        let mut config = LeaseConfig::default();
        let f = fixture(config.clone());
        add_task(&f.store, "a").await;
        let task = f.manager.claim_next(None).await.unwrap().unwrap();

        assert_eq!(f.manager.expire_stale_tasks().await.unwrap(), 0);

        config.stale_task_after_secs = Some(1);
        let manager = TaskLockManager::new(
            f.store.clone(),
            f.coordination.clone(),
            EventPublisher::new(f.coordination.clone()),
            config,
        );
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let report = manager.run_sweep().await.unwrap();
        assert_eq!(report.stale_failed, 1);

        let failed = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(
            failed.error.as_deref(),
            Some("task exceeded 1s processing bound")
        );
        assert!(f.coordination.get(&lease_key(task.id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let mut config = LeaseConfig::default();
        config.sweep_interval_secs = 1;
        let f = fixture(config);
        let (tx, rx) = watch::channel(false);

        let handle = Arc::new(f.manager).spawn_sweeper(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

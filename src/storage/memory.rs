//! In-memory state store
//!
//! Mirrors the conditional-update semantics of the PostgreSQL store so lock
//! and ingestion logic can be exercised without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{StateStore, StoreError, TaskFilter, TaskOutcome, DEFAULT_PAGE_SIZE};
use crate::models::{
    Heartbeat, PersistOutcome, ScrapeResult, SystemStats, Task, TaskProgress, TaskStatus,
    VideoDraft, Worker, WorkerStatus, WorkerUpdate,
};

#[derive(Default)]
struct State {
    tasks: HashMap<Uuid, Task>,
    workers: HashMap<Uuid, Worker>,
    results: HashMap<Uuid, ScrapeResult>,
}

/// In-memory implementation of [`StateStore`]
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    fail_result_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `persist_result` fail as if the database were unreachable
    pub fn set_fail_result_writes(&self, fail: bool) {
        self.fail_result_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of persisted video rows across all results
    pub async fn video_row_count(&self) -> usize {
        self.state
            .read()
            .await
            .results
            .values()
            .map(|r| r.videos.len())
            .sum()
    }

    pub async fn result_count(&self) -> usize {
        self.state.read().await.results.len()
    }
}

fn page<T>(items: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    items
        .into_iter()
        .skip(usize::try_from(offset.max(0)).unwrap_or(0))
        .take(usize::try_from(limit.max(0)).unwrap_or(0))
        .collect()
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        Ok(page(
            tasks,
            filter.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            filter.offset.unwrap_or(0),
        ))
    }

    async fn update_task_progress(
        &self,
        id: Uuid,
        progress: &TaskProgress,
    ) -> Result<Task, StoreError> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        if let Some(p) = progress.progress {
            task.progress = p;
        }
        if let Some(found) = progress.videos_found {
            task.videos_found = found;
        }
        if let Some(processed) = progress.videos_processed {
            task.videos_processed = processed;
        }
        Ok(task.clone())
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let existed = state.tasks.remove(&id).is_some();
        state.results.retain(|_, r| r.task_id != id);
        Ok(existed)
    }

    async fn pending_candidates(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        let mut pending: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.added_at.cmp(&b.added_at).then(a.id.cmp(&b.id)));
        Ok(page(pending, limit, 0))
    }

    async fn mark_processing(
        &self,
        id: Uuid,
        worker_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Processing;
                task.started_at = Some(at);
                task.worker_id = worker_id;
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn finish_task(
        &self,
        id: Uuid,
        outcome: &TaskOutcome,
        expected_worker: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Processing {
            return Ok(None);
        }
        if let (Some(expected), Some(assigned)) = (expected_worker, task.worker_id) {
            if expected != assigned {
                return Ok(None);
            }
        }

        task.status = outcome.status();
        task.completed_at = Some(at);
        task.error = outcome.error().map(str::to_string);
        if let Some(videos) = outcome.videos() {
            task.progress = 100;
            task.videos_found = videos;
            task.videos_processed = videos;
        }
        Ok(Some(task.clone()))
    }

    async fn task_status(&self, id: Uuid) -> Result<Option<TaskStatus>, StoreError> {
        Ok(self.state.read().await.tasks.get(&id).map(|t| t.status))
    }

    async fn stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Processing
                    && t.started_at.is_some_and(|s| s < started_before)
            })
            .cloned()
            .collect())
    }

    async fn register_worker(&self, name: &str, host: &str) -> Result<Worker, StoreError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        if let Some(existing) = state.workers.values_mut().find(|w| w.name == name) {
            existing.host = host.to_string();
            existing.status = WorkerStatus::Idle;
            existing.started_at = now;
            existing.last_activity = now;
            existing.current_task_id = None;
            existing.error_message = None;
            return Ok(existing.clone());
        }
        let worker = Worker::new(name, host);
        state.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, StoreError> {
        Ok(self.state.read().await.workers.get(&id).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let state = self.state.read().await;
        let mut workers: Vec<Worker> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }

    async fn update_worker(
        &self,
        id: Uuid,
        update: &WorkerUpdate,
    ) -> Result<Option<Worker>, StoreError> {
        let mut state = self.state.write().await;
        let Some(worker) = state.workers.get_mut(&id) else {
            return Ok(None);
        };
        match update.status {
            Some(status) if status != WorkerStatus::Error => {
                worker.status = status;
                worker.error_message = None;
            }
            Some(status) => {
                worker.status = status;
                if update.error_message.is_some() {
                    worker.error_message = update.error_message.clone();
                }
            }
            None => {
                if update.error_message.is_some() {
                    worker.error_message = update.error_message.clone();
                }
            }
        }
        if let Some(count) = update.processed_count {
            worker.processed_count = count;
        }
        worker.last_activity = Utc::now();
        Ok(Some(worker.clone()))
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        heartbeat: &Heartbeat,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(worker) = state.workers.get_mut(&id) else {
            return Ok(false);
        };
        worker.status = heartbeat.status;
        worker.processed_count = heartbeat.processed_count;
        worker.current_task_id = heartbeat.current_task_id;
        worker.error_message = heartbeat.error_message.clone();
        worker.last_activity = heartbeat.at;
        Ok(true)
    }

    async fn delete_worker(&self, id: Uuid) -> Result<Option<Worker>, StoreError> {
        Ok(self.state.write().await.workers.remove(&id))
    }

    async fn persist_result(
        &self,
        task_id: Uuid,
        drafts: Vec<VideoDraft>,
    ) -> Result<PersistOutcome, StoreError> {
        if self.fail_result_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Injected("result write".to_string()));
        }

        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        if let Some(existing) = state.results.values().find(|r| r.task_id == task_id) {
            return Ok(PersistOutcome {
                result: existing.clone(),
                created: false,
            });
        }

        let result = ScrapeResult::assemble(&task, drafts, Utc::now());
        state.results.insert(result.id, result.clone());
        Ok(PersistOutcome {
            result,
            created: true,
        })
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<ScrapeResult>, StoreError> {
        Ok(self.state.read().await.results.get(&id).cloned())
    }

    async fn list_results(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ScrapeResult>, StoreError> {
        let state = self.state.read().await;
        let mut results: Vec<ScrapeResult> = state.results.values().cloned().collect();
        results.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        Ok(page(results, limit, offset))
    }

    async fn stats(&self, stale_before: DateTime<Utc>) -> Result<SystemStats, StoreError> {
        let state = self.state.read().await;
        let mut stats = SystemStats::default();

        for task in state.tasks.values() {
            stats.tasks.total += 1;
            match task.status {
                TaskStatus::Pending => stats.tasks.pending += 1,
                TaskStatus::Processing => stats.tasks.processing += 1,
                TaskStatus::Completed => stats.tasks.completed += 1,
                TaskStatus::Failed => stats.tasks.failed += 1,
            }
        }

        for worker in state.workers.values() {
            stats.workers.total += 1;
            match worker.status {
                WorkerStatus::Idle => stats.workers.idle += 1,
                WorkerStatus::Running => stats.workers.running += 1,
                WorkerStatus::Paused => stats.workers.paused += 1,
                WorkerStatus::Error => stats.workers.error += 1,
            }
            if worker.is_stale(stale_before) {
                stats.workers.stale += 1;
            }
        }

        stats.total_results = state.results.len() as u64;
        stats.total_videos = state.results.values().map(|r| r.videos.len() as u64).sum();
        Ok(stats)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskKind;

    fn task(url: &str) -> Task {
        Task::new(url, TaskKind::Profile)
    }

    #[tokio::test]
    async fn test_pending_candidates_fifo() {
        let store = MemoryStore::new();
        let mut first = task("https://www.tiktok.com/@a");
        first.added_at = Utc::now() - chrono::Duration::seconds(10);
        let second = task("https://www.tiktok.com/@b");
        store.create_task(&second).await.unwrap();
        store.create_task(&first).await.unwrap();

        let candidates = store.pending_candidates(10).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id, first.id);

        let limited = store.pending_candidates(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_processing_is_conditional() {
        let store = MemoryStore::new();
        let t = task("https://www.tiktok.com/@a");
        store.create_task(&t).await.unwrap();

        let claimed = store.mark_processing(t.id, None, Utc::now()).await.unwrap();
        assert!(claimed.is_some());
        let again = store.mark_processing(t.id, None, Utc::now()).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_finish_task_checks_worker() {
        let store = MemoryStore::new();
        let t = task("https://www.tiktok.com/@a");
        store.create_task(&t).await.unwrap();
        let owner = Uuid::new_v4();
        store.mark_processing(t.id, Some(owner), Utc::now()).await.unwrap();

        let outcome = TaskOutcome::Failed {
            error: "nope".into(),
        };
        let wrong = store
            .finish_task(t.id, &outcome, Some(Uuid::new_v4()), Utc::now())
            .await
            .unwrap();
        assert!(wrong.is_none());

        let done = store
            .finish_task(t.id, &outcome, Some(owner), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("nope"));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_register_worker_keeps_id_for_same_name() {
        let store = MemoryStore::new();
        let first = store.register_worker("w1", "host-a").await.unwrap();
        let second = store.register_worker("w1", "host-b").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.host, "host-b");
        assert_eq!(store.list_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_result_is_idempotent_per_task() {
        let store = MemoryStore::new();
        let t = task("https://www.tiktok.com/@a");
        store.create_task(&t).await.unwrap();

        let first = store.persist_result(t.id, vec![]).await.unwrap();
        assert!(first.created);
        let second = store.persist_result(t.id, vec![]).await.unwrap();
        assert!(!second.created);
        assert_eq!(first.result.id, second.result.id);
        assert_eq!(store.result_count().await, 1);
    }

    #[tokio::test]
    async fn test_persist_result_unknown_task() {
        let store = MemoryStore::new();
        let err = store.persist_result(Uuid::new_v4(), vec![]).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_worker_clears_error_on_recovery() {
        let store = MemoryStore::new();
        let w = store.register_worker("w1", "h").await.unwrap();
        store
            .update_worker(
                w.id,
                &WorkerUpdate {
                    status: Some(WorkerStatus::Error),
                    error_message: Some("scraper missing".into()),
                    processed_count: None,
                },
            )
            .await
            .unwrap();
        let recovered = store
            .update_worker(
                w.id,
                &WorkerUpdate {
                    status: Some(WorkerStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recovered.status, WorkerStatus::Running);
        assert!(recovered.error_message.is_none());
    }
}

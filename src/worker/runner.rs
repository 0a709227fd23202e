//! Worker runner
//!
//! Drives one worker process against the coordinator: registration,
//! heartbeats, command handling, the claim/scrape/submit loop and graceful
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::control::{ControlAction, ControlMessage, StatusSnapshot};
use crate::coordination::{
    control_channel, SharedCoordination, Subscription, WORKER_STATUS_CHANNEL,
    WORKER_UPDATES_CHANNEL,
};
use crate::coordinator::client::{ClientConfig, CoordinatorClient};
use crate::events::{DomainEvent, EventAction, EventKind};
use crate::models::{Task, WorkerStatus, WorkerUpdate};

use super::config::WorkerConfig;
use super::scraper::ScraperCommand;
use super::state::{CommandEffect, WorkerState};
use super::RunnerError;

/// Upper bound on waiting for in-flight tasks at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Worker Runner
// ============================================================================

/// Main runner for a worker process
///
/// Handles:
/// - Registration with the coordinator (non-fatal, retried)
/// - Periodic status snapshots on `worker:status`
/// - Control commands on `worker:<name>:control`
/// - Deletion broadcasts on `worker:updates`
/// - Claiming tasks and running the scraper
/// - Graceful shutdown
#[derive(Clone)]
pub struct WorkerRunner {
    inner: Arc<Inner>,
}

struct Inner {
    config: WorkerConfig,
    client: CoordinatorClient,
    coordination: SharedCoordination,
    scraper: ScraperCommand,
    state: RwLock<WorkerState>,
    shutdown: watch::Sender<bool>,
}

/// Totals reported when the runner exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub worker_id: Option<Uuid>,
    pub processed_count: i64,
    /// In-flight tasks abandoned because they outlived the drain timeout
    pub aborted: usize,
}

impl WorkerRunner {
    pub fn new(config: WorkerConfig, coordination: SharedCoordination) -> Result<Self, RunnerError> {
        config.validate()?;

        let client = CoordinatorClient::new(
            ClientConfig::new(&config.coordinator_url).with_secret(config.api_secret.clone()),
        )?;
        let scraper = ScraperCommand::parse(&config.scraper_command, config.task_timeout())?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                coordination,
                scraper,
                state: RwLock::new(WorkerState::new()),
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub async fn status(&self) -> WorkerStatus {
        self.inner.state.read().await.status()
    }

    pub async fn worker_id(&self) -> Option<Uuid> {
        self.inner.state.read().await.worker_id()
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot().await
    }

    /// Ask the runner to stop claiming, drain and exit
    pub fn request_shutdown(&self) {
        self.inner.request_shutdown();
    }

    /// Register with the coordinator; failures are logged, not returned
    pub async fn register(&self) -> bool {
        self.inner.register().await
    }

    /// Run until shutdown is requested by a command, a deletion broadcast or
    /// [`request_shutdown`](Self::request_shutdown)
    pub async fn run(&self) -> Result<RunSummary, RunnerError> {
        let inner = &self.inner;
        tracing::info!(
            worker = %inner.config.name,
            coordinator = %inner.config.coordinator_url,
            scraper = %inner.scraper.program(),
            "Worker starting"
        );

        let commands = inner
            .coordination
            .subscribe(&[control_channel(&inner.config.name)])
            .await?;
        let lifecycle = inner
            .coordination
            .subscribe(&[WORKER_UPDATES_CHANNEL.to_string()])
            .await?;

        let registered = inner.register().await;

        let mut handles = vec![
            spawn_heartbeat_task(inner.clone()),
            spawn_command_listener(inner.clone(), commands),
            spawn_lifecycle_listener(inner.clone(), lifecycle),
        ];
        if !registered {
            handles.push(spawn_registration_task(inner.clone()));
        }

        if inner.config.auto_start {
            inner.apply(ControlAction::Start).await;
        }

        let tasks = inner.poll_loop().await;
        let aborted = drain(tasks).await;

        inner.state.write().await.terminate();
        let (worker_id, processed_count) = {
            let state = inner.state.read().await;
            (state.worker_id(), state.processed_count())
        };
        inner.report_final_status(worker_id, processed_count).await;

        inner.request_shutdown();
        for handle in handles {
            let _ = handle.await;
        }

        tracing::info!(
            worker = %inner.config.name,
            processed = processed_count,
            aborted,
            "Worker stopped"
        );

        Ok(RunSummary {
            worker_id,
            processed_count,
            aborted,
        })
    }
}

impl Inner {
    fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn register(&self) -> bool {
        match self
            .client
            .register(&self.config.name, &self.config.host)
            .await
        {
            Ok(worker) => {
                self.state.write().await.set_worker_id(worker.id);
                tracing::info!(worker = %worker.name, worker_id = %worker.id, "Registered with coordinator");
                true
            }
            Err(e) => {
                // Non-fatal: the worker can still claim anonymously
                tracing::warn!(
                    error = %e,
                    retry_secs = self.config.registration_retry_secs,
                    "Registration failed"
                );
                false
            }
        }
    }

    async fn snapshot(&self) -> StatusSnapshot {
        self.state
            .read()
            .await
            .snapshot(&self.config.name, &self.config.host, resident_memory())
    }

    /// Publish a snapshot on `worker:status`; skipped while unregistered
    async fn publish_status(&self) -> bool {
        let snapshot = self.snapshot().await;
        if snapshot.worker_id.is_none() {
            tracing::debug!("Unregistered, status report skipped");
            return false;
        }

        let payload = match serde_json::to_string(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode status snapshot");
                return false;
            }
        };
        match self
            .coordination
            .publish(WORKER_STATUS_CHANNEL, &payload)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to publish status snapshot");
                false
            }
        }
    }

    async fn apply(&self, action: ControlAction) {
        let effect = self.state.write().await.apply(action);
        match effect {
            CommandEffect::Transitioned { from, to } => {
                tracing::info!(action = %action, %from, %to, "Worker state changed");
                self.publish_status().await;
            }
            CommandEffect::Ignored { status } => {
                tracing::debug!(action = %action, %status, "Command ignored in current state");
            }
            CommandEffect::Terminate => {
                tracing::info!("Shutdown command received");
                self.request_shutdown();
            }
            CommandEffect::ReportStatus => {
                self.publish_status().await;
            }
        }
    }

    /// Claim and dispatch tasks until shutdown; returns the in-flight set
    async fn poll_loop(self: &Arc<Self>) -> JoinSet<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_tasks));
        let mut tasks = JoinSet::new();

        loop {
            if self.is_shutting_down() {
                break;
            }
            while tasks.try_join_next().is_some() {}

            let mut claimed = false;
            let (polling, worker_id) = {
                let state = self.state.read().await;
                (state.is_polling(), state.worker_id())
            };

            if polling {
                if let Ok(permit) = permits.clone().try_acquire_owned() {
                    match self.client.claim_next(worker_id).await {
                        Ok(Some(task)) => {
                            claimed = true;
                            self.state.write().await.begin_task(task.id);
                            let inner = self.clone();
                            tasks.spawn(async move {
                                inner.execute(task).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => tracing::debug!("No claimable tasks"),
                        Err(e) => tracing::warn!(error = %e, "Claim failed"),
                    }
                }
            }

            if claimed {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        tasks
    }

    /// Run the scraper for one claimed task and report the outcome
    async fn execute(&self, task: Task) {
        let worker_id = self.state.read().await.worker_id();
        tracing::info!(task_id = %task.id, url = %task.url, kind = %task.kind, "Running scraper");

        match self.scraper.run(&task).await {
            Ok(output) => {
                let elapsed_ms = output.elapsed.as_millis() as u64;
                match self
                    .client
                    .submit_results(task.id, worker_id, output.into_raw())
                    .await
                {
                    Ok(report) => tracing::info!(
                        task_id = %task.id,
                        videos = report.result.total_videos,
                        rejected = report.rejected.len(),
                        created = report.created,
                        elapsed_ms,
                        "Results submitted"
                    ),
                    // The coordinator fails the task itself on unusable batches
                    Err(e) => tracing::warn!(task_id = %task.id, error = %e, "Result submission failed"),
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Scraper failed");
                if let Err(report_err) = self
                    .client
                    .fail_task(task.id, worker_id, &e.to_string())
                    .await
                {
                    tracing::warn!(task_id = %task.id, error = %report_err, "Failed to report task failure");
                }

                if e.is_local_fault() {
                    tracing::error!(error = %e, "Scraper unavailable, polling stopped until restarted");
                    self.state.write().await.fail(e.to_string());
                    self.publish_status().await;
                }
            }
        }

        self.state.write().await.finish_task(task.id);
    }

    /// Best-effort final update; a deleted row is not an error
    async fn report_final_status(&self, worker_id: Option<Uuid>, processed_count: i64) {
        let Some(worker_id) = worker_id else {
            return;
        };
        let update = WorkerUpdate {
            status: Some(WorkerStatus::Idle),
            error_message: None,
            processed_count: Some(processed_count),
        };
        match self.client.update_worker(worker_id, &update).await {
            Ok(Some(_)) => tracing::debug!(worker_id = %worker_id, "Final status recorded"),
            Ok(None) => tracing::info!(worker_id = %worker_id, "Worker row already deleted"),
            Err(e) => tracing::warn!(worker_id = %worker_id, error = %e, "Final status update failed"),
        }
    }
}

// ============================================================================
// Background tasks
// ============================================================================

fn spawn_heartbeat_task(inner: Arc<Inner>) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval(inner.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    inner.publish_status().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::debug!("Heartbeat task shutting down");
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_registration_task(inner: Arc<Inner>) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval(inner.config.registration_retry());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if inner.register().await {
                        inner.publish_status().await;
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_command_listener(inner: Arc<Inner>, mut commands: Subscription) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = commands.recv() => {
                    let Some(msg) = msg else {
                        tracing::warn!("Control subscription closed");
                        break;
                    };
                    match serde_json::from_str::<ControlMessage>(&msg.payload) {
                        Ok(command) => inner.apply(command.action).await,
                        Err(e) => tracing::warn!(error = %e, payload = %msg.payload, "Undecodable control message"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_lifecycle_listener(inner: Arc<Inner>, mut lifecycle: Subscription) -> JoinHandle<()> {
    let mut shutdown_rx = inner.shutdown.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = lifecycle.recv() => {
                    let Some(msg) = msg else {
                        tracing::warn!("Lifecycle subscription closed");
                        break;
                    };
                    // Other payloads on this channel are not lifecycle events
                    let Ok(event) = serde_json::from_str::<DomainEvent>(&msg.payload) else {
                        continue;
                    };
                    if is_own_deletion(&event, inner.state.read().await.worker_id()) {
                        tracing::warn!("Worker deleted by operator, shutting down");
                        inner.request_shutdown();
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn is_own_deletion(event: &DomainEvent, own_id: Option<Uuid>) -> bool {
    event.kind == EventKind::Worker
        && event.action == EventAction::Delete
        && own_id.is_some()
        && event.subject_id() == own_id
}

/// Wait for in-flight tasks, aborting what outlives [`DRAIN_TIMEOUT`]
async fn drain(mut tasks: JoinSet<()>) -> usize {
    if tasks.is_empty() {
        return 0;
    }
    tracing::info!(in_flight = tasks.len(), "Waiting for in-flight tasks");

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, join_all(&mut tasks)).await;
    if drained.is_ok() {
        return 0;
    }

    let remaining = tasks.len();
    tracing::warn!(remaining, "In-flight tasks outlived the drain timeout, aborting");
    tasks.abort_all();
    join_all(&mut tasks).await;
    remaining
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}

/// Resident set size from /proc, when available
fn resident_memory() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

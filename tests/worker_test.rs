//! Worker runner tests
//!
//! A real runner against a mock coordinator (HTTP) and the in-memory
//! coordination store (commands, lifecycle, status).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use scrapefleet::control::{ControlAction, ControlMessage, StatusSnapshot};
use scrapefleet::coordination::{
    control_channel, CoordinationStore, MemoryCoordination, WORKER_STATUS_CHANNEL,
    WORKER_UPDATES_CHANNEL,
};
use scrapefleet::events::DomainEvent;
use scrapefleet::ingest::IngestReport;
use scrapefleet::models::{ScrapeResult, Task, TaskKind, TaskStatus, Worker, WorkerStatus};
use scrapefleet::worker::{RunSummary, WorkerConfig, WorkerRunner};

fn envelope<T: serde::Serialize>(data: T) -> serde_json::Value {
    json!({ "success": true, "data": data })
}

fn config(server: &MockServer, scraper: &str, auto_start: bool) -> WorkerConfig {
    WorkerConfig {
        name: "w1".to_string(),
        host: "test-host".to_string(),
        coordinator_url: server.uri(),
        poll_interval_secs: 1,
        heartbeat_interval_secs: 1,
        registration_retry_secs: 1,
        scraper_command: scraper.to_string(),
        auto_start,
        ..Default::default()
    }
}

/// Mount register, empty claim and worker update routes
async fn mount_coordinator(server: &MockServer, worker: &Worker) {
    Mock::given(method("POST"))
        .and(path("/api/workers/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(worker)))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/tasks/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": null })))
        .mount(server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("/api/workers/{}", worker.id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(worker)))
        .mount(server)
        .await;
}

/// Serve `task` to the first claim only
async fn mount_single_claim(server: &MockServer, task: &Task) {
    let mut claimed = task.clone();
    claimed.status = TaskStatus::Processing;
    Mock::given(method("POST"))
        .and(path("/api/tasks/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&claimed)))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(server)
        .await;
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn start(runner: &WorkerRunner) -> tokio::task::JoinHandle<RunSummary> {
    let runner = runner.clone();
    tokio::spawn(async move { runner.run().await.unwrap() })
}

async fn registered(runner: &WorkerRunner) {
    let r = runner.clone();
    eventually("registration", move || {
        let r = r.clone();
        async move { r.worker_id().await.is_some() }
    })
    .await;
}

async fn finished(handle: tokio::task::JoinHandle<RunSummary>) -> RunSummary {
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("runner did not stop")
        .unwrap()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_deletion_broadcast_stops_worker() {
    let server = MockServer::start().await;
    let worker = Worker::new("w1", "test-host");
    mount_coordinator(&server, &worker).await;

    let coordination = Arc::new(MemoryCoordination::new());
    let runner = WorkerRunner::new(config(&server, "unused-scraper", true), coordination.clone()).unwrap();
    let handle = start(&runner);
    registered(&runner).await;

    // Someone else's deletion is ignored
    let other = DomainEvent::worker_deleted(uuid::Uuid::new_v4(), "w2");
    coordination
        .publish(WORKER_UPDATES_CHANNEL, &serde_json::to_string(&other).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_finished());

    let own = DomainEvent::worker_deleted(worker.id, "w1");
    coordination
        .publish(WORKER_UPDATES_CHANNEL, &serde_json::to_string(&own).unwrap())
        .await
        .unwrap();

    let summary = finished(handle).await;
    assert_eq!(summary.worker_id, Some(worker.id));
    assert_eq!(summary.processed_count, 0);
}

#[tokio::test]
async fn test_final_update_tolerates_deleted_row() {
    let server = MockServer::start().await;
    let worker = Worker::new("w1", "test-host");
    Mock::given(method("PATCH"))
        .and(path(format!("/api/workers/{}", worker.id)))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "success": false, "error": "worker not found" })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_coordinator(&server, &worker).await;

    let coordination = Arc::new(MemoryCoordination::new());
    let runner = WorkerRunner::new(config(&server, "unused-scraper", true), coordination).unwrap();
    let handle = start(&runner);
    registered(&runner).await;

    runner.request_shutdown();
    let summary = finished(handle).await;
    assert_eq!(summary.worker_id, Some(worker.id));
}

#[tokio::test]
async fn test_control_commands_drive_state() {
    let server = MockServer::start().await;
    let worker = Worker::new("w1", "test-host");
    mount_coordinator(&server, &worker).await;

    let coordination = Arc::new(MemoryCoordination::new());
    let runner = WorkerRunner::new(config(&server, "unused-scraper", false), coordination.clone()).unwrap();
    let handle = start(&runner);
    registered(&runner).await;
    assert_eq!(runner.status().await, WorkerStatus::Idle);

    let channel = control_channel("w1");
    let send = |action: ControlAction| {
        let coordination = coordination.clone();
        let channel = channel.clone();
        async move {
            let payload = serde_json::to_string(&ControlMessage::new(action)).unwrap();
            coordination.publish(&channel, &payload).await.unwrap();
        }
    };

    send(ControlAction::Start).await;
    let r = runner.clone();
    eventually("RUNNING", move || {
        let r = r.clone();
        async move { r.status().await == WorkerStatus::Running }
    })
    .await;

    send(ControlAction::Pause).await;
    let r = runner.clone();
    eventually("PAUSED", move || {
        let r = r.clone();
        async move { r.status().await == WorkerStatus::Paused }
    })
    .await;

    send(ControlAction::Status).await;
    let c = coordination.clone();
    eventually("paused snapshot", move || {
        let c = c.clone();
        async move {
            c.published_on(WORKER_STATUS_CHANNEL)
                .await
                .iter()
                .filter_map(|m| serde_json::from_str::<StatusSnapshot>(&m.payload).ok())
                .any(|s| s.status == WorkerStatus::Paused && s.worker_id == Some(worker.id))
        }
    })
    .await;

    send(ControlAction::Shutdown).await;
    finished(handle).await;
}

// ============================================================================
// Task Execution
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_scraper_output_is_submitted() {
    let server = MockServer::start().await;
    let worker = Worker::new("w1", "test-host");
    let task = Task::new("https://www.tiktok.com/@creator", TaskKind::Profile);
    let report = IngestReport {
        result: ScrapeResult::assemble(&task, Vec::new(), chrono::Utc::now()),
        rejected: Vec::new(),
        created: true,
    };

    mount_single_claim(&server, &task).await;
    mount_coordinator(&server, &worker).await;
    Mock::given(method("POST"))
        .and(path(format!("/api/tasks/{}/results", task.id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&report)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("scraper.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\nprintf '[{\"url\": \"https://www.tiktok.com/@creator/video/1\", \"views\": 10}]'\n",
    )
    .unwrap();
    let command = format!("sh {}", script.display());

    let coordination = Arc::new(MemoryCoordination::new());
    let runner = WorkerRunner::new(config(&server, &command, true), coordination).unwrap();
    let handle = start(&runner);

    let r = runner.clone();
    eventually("task processed", move || {
        let r = r.clone();
        async move { r.snapshot().await.processed_count == 1 }
    })
    .await;

    runner.request_shutdown();
    let summary = finished(handle).await;
    assert_eq!(summary.processed_count, 1);
    assert_eq!(summary.aborted, 0);
}

#[tokio::test]
async fn test_missing_scraper_enters_error_state() {
    let server = MockServer::start().await;
    let worker = Worker::new("w1", "test-host");
    let task = Task::new("https://www.tiktok.com/@creator", TaskKind::Profile);
    let mut failed = task.clone();
    failed.status = TaskStatus::Failed;

    mount_single_claim(&server, &task).await;
    mount_coordinator(&server, &worker).await;
    Mock::given(method("POST"))
        .and(path(format!("/api/tasks/{}/fail", task.id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&failed)))
        .expect(1)
        .mount(&server)
        .await;

    let coordination = Arc::new(MemoryCoordination::new());
    let runner = WorkerRunner::new(
        config(&server, "scrapefleet-no-such-scraper", true),
        coordination,
    )
    .unwrap();
    let handle = start(&runner);

    let r = runner.clone();
    eventually("ERROR state", move || {
        let r = r.clone();
        async move { r.status().await == WorkerStatus::Error }
    })
    .await;

    let snapshot = runner.snapshot().await;
    assert!(snapshot
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("not found")));

    runner.request_shutdown();
    finished(handle).await;
}

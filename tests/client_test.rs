//! Coordinator client tests against a mock coordinator

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use scrapefleet::coordinator::{ClientConfig, ClientError, CoordinatorClient};
use scrapefleet::ingest::IngestReport;
use scrapefleet::models::{ScrapeResult, Task, TaskKind, Worker, WorkerStatus, WorkerUpdate};
use scrapefleet::utils::RetryConfig;

fn client(server: &MockServer) -> CoordinatorClient {
    CoordinatorClient::new(
        ClientConfig::new(server.uri())
            .with_secret(Some("s3cret".to_string()))
            .with_retry(RetryConfig::immediate(2)),
    )
    .unwrap()
}

fn envelope<T: serde::Serialize>(data: T) -> serde_json::Value {
    json!({ "success": true, "data": data })
}

#[tokio::test]
async fn test_register_sends_bearer_token() {
    let server = MockServer::start().await;
    let worker = Worker::new("w1", "10.0.0.5");

    Mock::given(method("POST"))
        .and(path("/api/workers/register"))
        .and(header("authorization", "Bearer s3cret"))
        .and(body_partial_json(json!({ "name": "w1", "host": "10.0.0.5" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&worker)))
        .expect(1)
        .mount(&server)
        .await;

    let registered = client(&server).register("w1", "10.0.0.5").await.unwrap();
    assert_eq!(registered.id, worker.id);
    assert_eq!(registered.status, WorkerStatus::Idle);
}

#[tokio::test]
async fn test_claim_null_means_no_task() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/tasks/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": null })))
        .mount(&server)
        .await;

    assert!(client(&server).claim_next(None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_is_never_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/tasks/claim"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({ "success": false, "error": "redis down" })))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).claim_next(Some(Uuid::new_v4())).await.unwrap_err();
    match err {
        ClientError::Http { status, message } => {
            assert_eq!(status, 503);
            assert_eq!(message, "redis down");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_submit_retries_transient_failures() {
    let server = MockServer::start().await;
    let task = Task::new("https://www.tiktok.com/@creator", TaskKind::Profile);
    let report = IngestReport {
        result: ScrapeResult::assemble(&task, Vec::new(), Utc::now()),
        rejected: Vec::new(),
        created: true,
    };
    let route = format!("/api/tasks/{}/results", task.id);

    Mock::given(method("POST"))
        .and(path(route.clone()))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&report)))
        .expect(1)
        .mount(&server)
        .await;

    let submitted = client(&server)
        .submit_results(task.id, None, json!([]))
        .await
        .unwrap();
    assert_eq!(submitted.result.task_id, task.id);
}

#[tokio::test]
async fn test_unprocessable_batch_is_not_retried() {
    let server = MockServer::start().await;
    let task_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/api/tasks/{task_id}/results")))
        .respond_with(ResponseTemplate::new(422).set_body_json(
            json!({ "success": false, "error": "no valid records in batch (3 rejected)" }),
        ))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .submit_results(task_id, None, json!("garbage"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Http { status: 422, .. }));
}

#[tokio::test]
async fn test_update_deleted_worker_is_not_an_error() {
    let server = MockServer::start().await;
    let worker_id = Uuid::new_v4();

    Mock::given(method("PATCH"))
        .and(path(format!("/api/workers/{worker_id}")))
        .respond_with(ResponseTemplate::new(404).set_body_json(
            json!({ "success": false, "error": "worker not found" }),
        ))
        .mount(&server)
        .await;

    let update = WorkerUpdate {
        status: Some(WorkerStatus::Idle),
        error_message: None,
        processed_count: Some(4),
    };
    let updated = client(&server).update_worker(worker_id, &update).await.unwrap();
    assert!(updated.is_none());
}

#[tokio::test]
async fn test_unreachable_coordinator() {
    let client = CoordinatorClient::new(
        ClientConfig::new("http://127.0.0.1:1").with_retry(RetryConfig::immediate(0)),
    )
    .unwrap();

    assert!(!client.is_healthy().await);
    assert!(matches!(
        client.claim_next(None).await,
        Err(ClientError::Network(_))
    ));
}

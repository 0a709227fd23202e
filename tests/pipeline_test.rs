//! Ingestion pipeline integration tests
//!
//! Raw scraper batches through extraction, cleaning, validation, metrics,
//! categorization and atomic persistence.

mod common;

use serde_json::json;

use scrapefleet::coordination::RESULT_UPDATES_CHANNEL;
use scrapefleet::ingest::extract::{JSON_END_MARKER, JSON_START_MARKER};
use scrapefleet::ingest::{IngestError, RejectReason};

use common::{batch, harness, pending_task, video};

#[tokio::test]
async fn test_partial_batch_persists_valid_records_only() {
    let h = harness();
    let task = pending_task(&h.store, "creator").await;

    let report = h
        .state
        .pipeline
        .ingest(task.id, &batch(8, 2))
        .await
        .unwrap();

    assert!(report.created);
    assert_eq!(report.result.total_videos, 8);
    assert_eq!(report.result.successful_videos, 8);
    assert_eq!(report.result.failed_videos, 0);
    assert_eq!(report.result.subject, "creator");
    assert_eq!(report.rejected.len(), 2);
    assert!(report
        .rejected
        .iter()
        .all(|r| r.reason == RejectReason::MissingUrl));
    assert_eq!(h.store.video_row_count().await, 8);

    let first = &report.result.videos[0];
    assert_eq!(first.views, 1200);
    assert!(first.categories.has_trending_hashtags);
    assert!(first.categories.has_music);
    assert!((first.metrics.engagement_rate - 115.0 / 1200.0 * 100.0).abs() < 1e-6);

    let published = h.coordination.published_on(RESULT_UPDATES_CHANNEL).await;
    assert_eq!(published.len(), 1);
}

#[tokio::test]
async fn test_text_output_with_markers() {
    let h = harness();
    let task = pending_task(&h.store, "creator").await;

    let raw = json!(format!(
        "Launching browser...\nscrolled 3 pages\n{JSON_START_MARKER}{}{JSON_END_MARKER}\ndone",
        serde_json::to_string(&batch(3, 0)).unwrap()
    ));
    let report = h.state.pipeline.ingest(task.id, &raw).await.unwrap();
    assert_eq!(report.result.total_videos, 3);
}

#[tokio::test]
async fn test_second_ingest_returns_existing_result() {
    let h = harness();
    let task = pending_task(&h.store, "creator").await;

    let first = h.state.pipeline.ingest(task.id, &batch(2, 0)).await.unwrap();
    let second = h.state.pipeline.ingest(task.id, &batch(5, 0)).await.unwrap();

    assert!(!second.created);
    assert_eq!(second.result.id, first.result.id);
    assert_eq!(second.result.total_videos, 2);
    assert_eq!(h.store.result_count().await, 1);
    assert_eq!(
        h.coordination.published_on(RESULT_UPDATES_CHANNEL).await.len(),
        1
    );
}

#[tokio::test]
async fn test_persist_failure_leaves_no_rows() {
    let h = harness();
    let task = pending_task(&h.store, "creator").await;
    h.store.set_fail_result_writes(true);

    let err = h
        .state
        .pipeline
        .ingest(task.id, &batch(4, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Persist(_)));
    assert_eq!(h.store.video_row_count().await, 0);
    assert_eq!(h.store.result_count().await, 0);
    assert!(h
        .coordination
        .published_on(RESULT_UPDATES_CHANNEL)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_foreign_hosts_and_duplicates_rejected() {
    let h = harness();
    let task = pending_task(&h.store, "creator").await;

    let raw = json!([
        video(1),
        { "url": "https://www.youtube.com/watch?v=abc", "views": 10 },
        video(1),
        video(2)
    ]);
    let report = h.state.pipeline.ingest(task.id, &raw).await.unwrap();

    assert_eq!(report.result.total_videos, 2);
    let reasons: Vec<_> = report.rejected.iter().map(|r| (r.index, &r.reason)).collect();
    assert!(matches!(reasons[0], (1, RejectReason::UnexpectedHost(_))));
    assert!(matches!(reasons[1], (2, RejectReason::DuplicateVideoId(_))));
}

#[tokio::test]
async fn test_unusable_output_is_an_ingestion_error() {
    let h = harness();
    let task = pending_task(&h.store, "creator").await;

    let err = h
        .state
        .pipeline
        .ingest(task.id, &json!("Error: captcha wall, no results"))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Extraction(_)));

    let err = h
        .state
        .pipeline
        .ingest(task.id, &batch(0, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::NoValidRecords { rejected: 3 }));
    assert_eq!(h.store.result_count().await, 0);
}

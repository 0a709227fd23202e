//! Result ingestion pipeline
//!
//! # Architecture
//!
//! ```text
//! raw ──► extract ──► clean ──► validate ──► metrics ──► categorize
//!                       │          │                         │
//!                       └──────────┴─► rejected              ▼
//!                                                     dedupe by video id
//!                                                            │
//!                              result:updates ◄── persist (one transaction)
//! ```
//!
//! Extraction failures and batches with no valid records fail the whole
//! ingestion; the caller marks the task FAILED. Persistence failures are
//! hard errors and leave no partial rows behind.

pub mod categorize;
pub mod clean;
pub mod engagement;
pub mod extract;
pub mod validate;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::events::EventPublisher;
use crate::metrics;
use crate::models::{ScrapeResult, VideoDraft};
use crate::storage::{SharedStateStore, StoreError};

pub use clean::{clean_record, parse_count, parse_count_str, CleanedRecord};
pub use extract::{extract_records, ExtractionError};

// ============================================================================
// Rejections and errors
// ============================================================================

/// Why a single record was dropped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum RejectReason {
    NotAnObject,
    MissingUrl,
    InvalidUrl,
    UnexpectedHost(String),
    InvalidCounters,
    DuplicateVideoId(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnObject => f.write_str("record is not an object"),
            Self::MissingUrl => f.write_str("missing url"),
            Self::InvalidUrl => f.write_str("url is not a recognizable link"),
            Self::UnexpectedHost(host) => write!(f, "unexpected host {host}"),
            Self::InvalidCounters => f.write_str("counters are not numeric"),
            Self::DuplicateVideoId(id) => write!(f, "duplicate video id {id}"),
        }
    }
}

/// A dropped record and its position in the batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub index: usize,
    #[serde(flatten)]
    pub reason: RejectReason,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("could not extract records: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("no valid records in batch ({rejected} rejected)")]
    NoValidRecords { rejected: usize },

    #[error("failed to persist result: {0}")]
    Persist(#[from] StoreError),
}

impl FleetErrorTrait for IngestError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Persist(e) => e.is_recoverable(),
            _ => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Persist(_) => ErrorCategory::Persistence,
            _ => ErrorCategory::Ingestion,
        }
    }
}

// ============================================================================
// Batch preparation
// ============================================================================

/// Output of the pure (no I/O) part of the pipeline
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub drafts: Vec<VideoDraft>,
    pub rejected: Vec<Rejection>,
}

/// Extract, clean, validate, score and categorize a raw batch
pub fn prepare_batch(
    raw: &Value,
    expected_host: &str,
    now: DateTime<Utc>,
) -> Result<PreparedBatch, IngestError> {
    let records = {
        let _timer = metrics::start_ingest_timer("extract");
        extract_records(raw)?
    };

    let mut drafts = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    let mut seen = HashSet::new();

    for (index, raw_record) in records.iter().enumerate() {
        let cleaned = clean_record(raw_record, now)
            .and_then(|r| validate::validate_record(&r, expected_host).map(|()| r));

        let record = match cleaned {
            Ok(record) => record,
            Err(reason) => {
                tracing::debug!(index, %reason, "Record rejected");
                rejected.push(Rejection { index, reason });
                continue;
            }
        };

        if !seen.insert(record.video_id.clone()) {
            rejected.push(Rejection {
                index,
                reason: RejectReason::DuplicateVideoId(record.video_id),
            });
            continue;
        }

        drafts.push(to_draft(record));
    }

    if drafts.is_empty() {
        return Err(IngestError::NoValidRecords {
            rejected: rejected.len(),
        });
    }

    Ok(PreparedBatch { drafts, rejected })
}

fn to_draft(record: CleanedRecord) -> VideoDraft {
    let metrics =
        engagement::compute_metrics(record.views, record.likes, record.comments, record.shares);
    let categories = categorize::categorize(&record.description, &record.hashtags);

    VideoDraft {
        video_id: record.video_id,
        url: record.url,
        description: record.description,
        views: record.views,
        likes: record.likes,
        comments: record.comments,
        shares: record.shares,
        duration: record.duration,
        upload_date: record.upload_date,
        hashtags: record.hashtags,
        mentions: record.mentions,
        comment_texts: record.comment_texts,
        metrics,
        categories,
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Outcome of a successful ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub result: ScrapeResult,
    pub rejected: Vec<Rejection>,
    /// False when the task already had a result and it was returned as is
    pub created: bool,
}

pub struct IngestionPipeline {
    store: SharedStateStore,
    events: EventPublisher,
    config: IngestConfig,
}

impl IngestionPipeline {
    pub fn new(store: SharedStateStore, events: EventPublisher, config: IngestConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Ingest one raw batch for a task and persist it atomically
    pub async fn ingest(&self, task_id: Uuid, raw: &Value) -> Result<IngestReport, IngestError> {
        let prepared = match prepare_batch(raw, &self.config.expected_host, Utc::now()) {
            Ok(prepared) => prepared,
            Err(e) => {
                metrics::record_ingest("rejected", 0, rejected_count(&e));
                tracing::warn!(task_id = %task_id, error = %e, "Ingestion rejected batch");
                return Err(e);
            }
        };

        let accepted = prepared.drafts.len();
        let rejected = prepared.rejected;

        let outcome = {
            let _timer = metrics::start_ingest_timer("persist");
            self.store.persist_result(task_id, prepared.drafts).await
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::record_ingest("persist_failed", 0, 0);
                tracing::error!(task_id = %task_id, error = %e, "Result persistence failed");
                return Err(e.into());
            }
        };

        if outcome.created {
            metrics::record_ingest("persisted", accepted, rejected.len());
            tracing::info!(
                task_id = %task_id,
                result_id = %outcome.result.id,
                videos = outcome.result.total_videos,
                rejected = rejected.len(),
                "Result persisted"
            );
            self.events.result_created(&outcome.result).await;
        } else {
            metrics::record_ingest("duplicate", 0, 0);
            tracing::info!(task_id = %task_id, result_id = %outcome.result.id, "Result already present");
        }

        Ok(IngestReport {
            result: outcome.result,
            rejected,
            created: outcome.created,
        })
    }
}

fn rejected_count(e: &IngestError) -> usize {
    match e {
        IngestError::NoValidRecords { rejected } => *rejected,
        _ => 0,
    }
}

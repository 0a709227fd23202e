//! Prometheus metrics for the scrapefleet coordinator
//!
//! This module provides metrics tracking for:
//! - Task leasing: claim outcomes, sweep repairs, stale-task expiries
//! - Control plane: heartbeats, control commands, worker gauges
//! - Ingestion: batches per outcome, accepted/rejected records, duration
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Lease and control-plane metrics
struct CoordinatorMetrics {
    claims: CounterVec,
    sweep_repairs: Counter,
    stale_tasks_failed: Counter,
    heartbeats: Counter,
    heartbeat_errors: Counter,
    control_commands: CounterVec,
    registered_workers: Gauge,
    stale_workers: Gauge,
    api_requests: CounterVec,
    api_duration: HistogramVec,
}

/// Ingestion pipeline metrics
struct IngestMetrics {
    batches: CounterVec,
    records: CounterVec,
    duration: HistogramVec,
}

static COORDINATOR_METRICS: OnceLock<CoordinatorMetrics> = OnceLock::new();

static INGEST_METRICS: OnceLock<IngestMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Call once at startup. If registration fails the error is returned and
/// subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = scrapefleet::metrics::init_metrics() {
///     tracing::warn!("Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let coordinator = CoordinatorMetrics {
        claims: register_counter_vec!(
            "scrapefleet_claims_total",
            "Claim attempts by outcome",
            &["outcome"]
        )?,
        sweep_repairs: register_counter!(
            "scrapefleet_sweep_repaired_leases_total",
            "Orphan leases deleted by the sweep"
        )?,
        stale_tasks_failed: register_counter!(
            "scrapefleet_stale_tasks_failed_total",
            "PROCESSING tasks failed for exceeding the processing bound"
        )?,
        heartbeats: register_counter!(
            "scrapefleet_heartbeats_total",
            "Worker status snapshots persisted"
        )?,
        heartbeat_errors: register_counter!(
            "scrapefleet_heartbeat_errors_total",
            "Worker status snapshots that could not be decoded or stored"
        )?,
        control_commands: register_counter_vec!(
            "scrapefleet_control_commands_total",
            "Control commands published by action",
            &["action"]
        )?,
        registered_workers: register_gauge!(
            "scrapefleet_registered_workers",
            "Number of registered workers"
        )?,
        stale_workers: register_gauge!(
            "scrapefleet_stale_workers",
            "Number of workers with no recent heartbeat"
        )?,
        api_requests: register_counter_vec!(
            "scrapefleet_api_requests_total",
            "Total API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
        api_duration: register_histogram_vec!(
            "scrapefleet_api_request_duration_seconds",
            "API request duration in seconds",
            &["endpoint"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        )?,
    };

    let ingest = IngestMetrics {
        batches: register_counter_vec!(
            "scrapefleet_ingest_batches_total",
            "Ingested batches by outcome",
            &["outcome"]
        )?,
        records: register_counter_vec!(
            "scrapefleet_ingest_records_total",
            "Ingested records by disposition",
            &["disposition"]
        )?,
        duration: register_histogram_vec!(
            "scrapefleet_ingest_duration_seconds",
            "Time spent ingesting one batch",
            &["stage"],
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
        )?,
    };

    COORDINATOR_METRICS
        .set(coordinator)
        .map_err(|_| "Coordinator metrics already initialized")?;
    INGEST_METRICS
        .set(ingest)
        .map_err(|_| "Ingest metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    COORDINATOR_METRICS.get().is_some() && INGEST_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Outcome of one claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// A task was claimed
    Claimed,
    /// No PENDING candidates
    Empty,
    /// Every candidate's lease was already held
    Contended,
    /// A lease was won but the conditional update lost
    LostRace,
}

impl ClaimOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Empty => "empty",
            Self::Contended => "contended",
            Self::LostRace => "lost_race",
        }
    }
}

pub fn record_claim(outcome: ClaimOutcome) {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.claims.with_label_values(&[outcome.as_str()]).inc();
    }
}

pub fn record_sweep(repaired: usize, stale_failed: usize) {
    let Some(m) = COORDINATOR_METRICS.get() else {
        return;
    };
    m.sweep_repairs.inc_by(repaired as f64);
    m.stale_tasks_failed.inc_by(stale_failed as f64);
}

pub fn record_heartbeat() {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.heartbeats.inc();
    }
}

pub fn record_heartbeat_error() {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.heartbeat_errors.inc();
    }
}

pub fn record_control_command(action: &str) {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.control_commands.with_label_values(&[action]).inc();
    }
}

/// Update worker gauges
pub fn update_worker_gauges(registered: u64, stale: u64) {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.registered_workers.set(registered as f64);
        m.stale_workers.set(stale as f64);
    }
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16, duration_secs: f64) {
    let Some(m) = COORDINATOR_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.api_requests
        .with_label_values(&[endpoint, &status_str])
        .inc();
    m.api_duration
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

/// Record the outcome of one ingestion call
pub fn record_ingest(outcome: &str, accepted: usize, rejected: usize) {
    let Some(m) = INGEST_METRICS.get() else {
        return;
    };
    m.batches.with_label_values(&[outcome]).inc();
    m.records
        .with_label_values(&["accepted"])
        .inc_by(accepted as f64);
    m.records
        .with_label_values(&["rejected"])
        .inc_by(rejected as f64);
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start an ingestion stage timer
pub fn start_ingest_timer(stage: &str) -> MetricsTimer {
    match INGEST_METRICS.get() {
        Some(m) => MetricsTimer::new(m.duration.with_label_values(&[stage]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

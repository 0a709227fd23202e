//! Health and observability endpoints
//!
//! - `/health/live`: the process is up
//! - `/health/ready`: both the durable store and the coordination store answer
//! - `/api/health`: version, uptime and component checks (no auth)
//! - `/metrics`: Prometheus text exposition
//!
//! Readiness fails with 503 as soon as either store stops answering; a
//! worker-side outage never affects these probes.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::time::Instant;

use super::api::ApiResponse;
use super::server::AppState;
use crate::metrics;

// ============================================================================
// Health Status Types
// ============================================================================

/// Overall health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub latency_ms: u64,
}

/// Liveness probe response
#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: HealthStatus,
    pub timestamp: String,
}

/// Readiness probe response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub timestamp: String,
    pub checks: Vec<ComponentHealth>,
}

/// `/api/health` payload
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub checks: Vec<ComponentHealth>,
}

// ============================================================================
// Health Check Router
// ============================================================================

/// Create the unauthenticated health and metrics router
pub fn create_health_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn liveness_probe() -> impl IntoResponse {
    Json(LivenessResponse {
        status: HealthStatus::Healthy,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn readiness_probe(State(state): State<AppState>) -> impl IntoResponse {
    let checks = component_checks(&state).await;
    let status = overall(&checks);

    let response = ReadinessResponse {
        status,
        timestamp: chrono::Utc::now().to_rfc3339(),
        checks,
    };
    (status.status_code(), Json(response))
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let checks = component_checks(&state).await;
    let status = overall(&checks);

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        checks,
    };
    (status.status_code(), Json(ApiResponse::success(response)))
}

async fn metrics_endpoint() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn component_checks(state: &AppState) -> Vec<ComponentHealth> {
    let start = Instant::now();
    let store = state.store.health_check().await;
    let store_check = component("state_store", store.err().map(|e| e.to_string()), start);

    let start = Instant::now();
    let coordination = state.coordination.ping().await;
    let coordination_check = component(
        "coordination_store",
        coordination.err().map(|e| e.to_string()),
        start,
    );

    vec![store_check, coordination_check]
}

fn component(name: &str, error: Option<String>, start: Instant) -> ComponentHealth {
    ComponentHealth {
        name: name.to_string(),
        status: if error.is_some() {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        },
        message: error,
        latency_ms: start.elapsed().as_millis() as u64,
    }
}

fn overall(checks: &[ComponentHealth]) -> HealthStatus {
    if checks.iter().all(|c| c.status == HealthStatus::Healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_code() {
        assert_eq!(HealthStatus::Healthy.status_code(), StatusCode::OK);
        assert_eq!(
            HealthStatus::Unhealthy.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(HealthStatus::Unhealthy.as_str(), "unhealthy");
    }

    #[test]
    fn test_overall_requires_every_component() {
        let now = Instant::now();
        let healthy = component("a", None, now);
        let broken = component("b", Some("refused".into()), now);

        assert_eq!(overall(&[healthy.clone()]), HealthStatus::Healthy);
        assert_eq!(overall(&[healthy, broken]), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_component_health_serialization() {
        let json = serde_json::to_string(&component("redis", None, Instant::now())).unwrap();
        assert!(json.contains("\"name\":\"redis\""));
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(!json.contains("message"));
    }
}

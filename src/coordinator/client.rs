//! Coordinator client used by worker processes
//!
//! Wraps the `/api/*` routes a worker needs: registration, claiming, result
//! submission, failure reporting and status updates. Idempotent calls retry
//! transient failures with backoff; claiming never retries because a lost
//! response could otherwise claim a second task.

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ErrorCategory, FleetErrorTrait};
use crate::ingest::IngestReport;
use crate::models::{Task, Worker, WorkerUpdate};
use crate::utils::retry::{with_retry_if, RetryConfig};

use super::api::{
    ApiResponse, ClaimRequest, FailTaskRequest, RegisterRequest, SubmitResultsRequest,
};

// ============================================================================
// Client Configuration
// ============================================================================

/// Configuration for the coordinator client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator base URL
    pub coordinator_url: String,

    /// Bearer secret, when the coordinator requires one
    pub api_secret: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,

    /// Retry policy for idempotent calls
    pub retry: RetryConfig,
}

impl ClientConfig {
    pub fn new(coordinator_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
            api_secret: None,
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.api_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

// ============================================================================
// Coordinator Client
// ============================================================================

/// HTTP client for the coordinator API
#[derive(Clone)]
pub struct CoordinatorClient {
    config: ClientConfig,
    http: Client,
}

impl CoordinatorClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Register (or re-register) this worker by name
    pub async fn register(&self, name: &str, host: &str) -> Result<Worker, ClientError> {
        let body = RegisterRequest {
            name: name.to_string(),
            host: host.to_string(),
        };
        self.call_with_retry(Method::POST, "/api/workers/register", Some(&body))
            .await?
            .ok_or_else(missing_data)
    }

    /// Claim the next task, `None` when nothing is claimable
    pub async fn claim_next(&self, worker_id: Option<Uuid>) -> Result<Option<Task>, ClientError> {
        let body = ClaimRequest { worker_id };
        let data: Option<Option<Task>> = self
            .call(Method::POST, "/api/tasks/claim", Some(&body))
            .await?;
        Ok(data.flatten())
    }

    /// Submit a raw scraper batch for a claimed task
    pub async fn submit_results(
        &self,
        task_id: Uuid,
        worker_id: Option<Uuid>,
        raw: Value,
    ) -> Result<IngestReport, ClientError> {
        let body = SubmitResultsRequest { worker_id, raw };
        let path = format!("/api/tasks/{task_id}/results");
        self.call_with_retry(Method::POST, &path, Some(&body))
            .await?
            .ok_or_else(missing_data)
    }

    /// Mark a claimed task FAILED
    pub async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: Option<Uuid>,
        error: &str,
    ) -> Result<Task, ClientError> {
        let body = FailTaskRequest {
            worker_id,
            error: error.to_string(),
        };
        let path = format!("/api/tasks/{task_id}/fail");
        self.call_with_retry(Method::POST, &path, Some(&body))
            .await?
            .ok_or_else(missing_data)
    }

    /// Update this worker's row. A deleted worker yields `Ok(None)`.
    pub async fn update_worker(
        &self,
        worker_id: Uuid,
        update: &WorkerUpdate,
    ) -> Result<Option<Worker>, ClientError> {
        let path = format!("/api/workers/{worker_id}");
        match self.call_with_retry(Method::PATCH, &path, Some(update)).await {
            Ok(worker) => Ok(worker),
            Err(ClientError::NotFound(_)) => {
                tracing::debug!(worker_id = %worker_id, "Worker row already gone");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// True when `/api/health` answers 200
    pub async fn is_healthy(&self) -> bool {
        self.call::<(), Value>(Method::GET, "/api/health", None)
            .await
            .is_ok()
    }

    async fn call_with_retry<B, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<R>, ClientError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        with_retry_if(
            &self.config.retry,
            move || self.call(method.clone(), path, body),
            ClientError::is_recoverable,
        )
        .await
    }

    async fn call<B, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Option<R>, ClientError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!(
            "{}{}",
            self.config.coordinator_url.trim_end_matches('/'),
            path
        );

        let mut request = self.http.request(method, &url);
        if let Some(secret) = &self.config.api_secret {
            request = request.bearer_auth(secret);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
            };
            return Err(if status == StatusCode::NOT_FOUND {
                ClientError::NotFound(message)
            } else {
                ClientError::Http {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let envelope: ApiResponse<R> = response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;

        if !envelope.success {
            return Err(ClientError::Rejected(
                envelope.error.unwrap_or_else(|| "unspecified error".to_string()),
            ));
        }
        Ok(envelope.data)
    }
}

fn missing_data() -> ClientError {
    ClientError::Parse("response carried no data".to_string())
}

// ============================================================================
// Client Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("client initialization failed: {0}")]
    Init(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("invalid response: {0}")]
    Parse(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl FleetErrorTrait for ClientError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Http { status: 409, .. } => ErrorCategory::Contention,
            Self::Http { status: 422, .. } => ErrorCategory::Ingestion,
            Self::Init(_) => ErrorCategory::Config,
            _ => ErrorCategory::Network,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new("http://localhost:8000")
            .with_secret(Some(String::new()))
            .with_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig::immediate(1));

        assert_eq!(config.api_secret, None);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_retries, 1);
    }

    #[test]
    fn test_error_classification() {
        let unavailable = ClientError::Http {
            status: 503,
            message: "down".into(),
        };
        assert!(unavailable.is_recoverable());

        let conflict = ClientError::Http {
            status: 409,
            message: "taken".into(),
        };
        assert!(!conflict.is_recoverable());
        assert_eq!(conflict.category(), ErrorCategory::Contention);

        assert!(!ClientError::NotFound("worker".into()).is_recoverable());
        assert!(ClientError::Network("reset".into()).is_recoverable());
    }
}

//! REST API handlers for the coordinator
//!
//! Every response uses the `{success, data?, error?}` envelope. Domain errors
//! are mapped to status codes in one place, [`ApiError`].

use std::convert::Infallible;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use uuid::Uuid;

use crate::control::{ControlAction, ControlError};
use crate::coordination::CoordinationError;
use crate::error::FleetErrorTrait;
use crate::events::EventAction;
use crate::ingest::{IngestError, IngestReport};
use crate::lock::LockError;
use crate::metrics;
use crate::models::{
    detect_task_kind, NewTask, ScrapeResult, SystemStats, Task, TaskProgress, TaskStatus, Worker,
    WorkerUpdate,
};
use crate::storage::{StoreError, TaskFilter, DEFAULT_PAGE_SIZE};

use super::auth::require_bearer;
use super::server::AppState;

/// Largest page a list endpoint returns
pub const MAX_PAGE_SIZE: i64 = 1000;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// A worker row plus its liveness verdict
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub worker: Worker,
    pub stale: bool,
}

/// Acknowledgement of a control command
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub worker_id: Uuid,
    pub action: ControlAction,
    /// Subscribers that received the command; zero means nobody listened
    pub receivers: usize,
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub worker_id: Option<Uuid>,
}

/// Progress counters, optionally with a terminal status
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateTaskRequest {
    #[serde(flatten)]
    pub progress: TaskProgress,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub worker_id: Option<Uuid>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResultsRequest {
    #[serde(default)]
    pub worker_id: Option<Uuid>,
    pub raw: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailTaskRequest {
    #[serde(default)]
    pub worker_id: Option<Uuid>,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: String,
}

// ============================================================================
// Errors
// ============================================================================

/// Handler error carrying the HTTP status to answer with
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(entity: &str, id: Uuid) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{entity} not found: {id}"))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "Request failed");
        }
        (self.status, Json(ErrorResponse::new(self.message))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            StoreError::Conflict(_) => Self::conflict(e.to_string()),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<CoordinationError> for ApiError {
    fn from(e: CoordinationError) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    }
}

impl From<LockError> for ApiError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Store(e) => e.into(),
            LockError::Coordination(e) => e.into(),
            LockError::TaskNotFound(id) => Self::not_found("task", id),
            LockError::InvalidState { .. } | LockError::NotAssigned { .. } => {
                Self::conflict(e.to_string())
            }
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::Store(e) => e.into(),
            ControlError::Coordination(e) => e.into(),
            ControlError::WorkerNotFound(id) => Self::not_found("worker", id),
            ControlError::MissingErrorMessage | ControlError::EmptyField { .. } => {
                Self::bad_request(e.to_string())
            }
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Persist(e) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            _ => Self::new(StatusCode::UNPROCESSABLE_ENTITY, e.user_message()),
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

fn page(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    (
        limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        offset.unwrap_or(0).max(0),
    )
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the authenticated `/api/*` router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Tasks
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/claim", post(claim_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/results", post(submit_results))
        .route("/api/tasks/{id}/fail", post(fail_task))
        // Results
        .route("/api/results", get(list_results))
        .route("/api/results/{id}", get(get_result))
        // Workers
        .route("/api/workers", get(list_workers))
        .route("/api/workers/register", post(register_worker))
        .route(
            "/api/workers/{id}",
            get(get_worker).patch(update_worker).delete(delete_worker),
        )
        .route("/api/workers/{id}/control", post(send_control))
        // Aggregates and live feed
        .route("/api/stats", get(get_stats))
        .route("/api/events", get(live_events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .route_layer(middleware::from_fn(track_requests))
        .with_state(state)
}

async fn track_requests(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    metrics::record_api_request(
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

// ============================================================================
// Task Handlers
// ============================================================================

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Vec<Task>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let (limit, offset) = page(query.limit, query.offset);

    let filter = TaskFilter {
        status,
        limit: Some(limit),
        offset: Some(offset),
    };
    ok(state.store.list_tasks(&filter).await?)
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<NewTask>,
) -> Result<(StatusCode, Json<ApiResponse<Task>>), ApiError> {
    let url = request.url.trim();
    let detected = detect_task_kind(url)
        .ok_or_else(|| ApiError::bad_request(format!("unrecognized target url: {url}")))?;

    let task = Task::new(url, request.kind.unwrap_or(detected));
    state.store.create_task(&task).await?;

    tracing::info!(task_id = %task.id, url = %task.url, kind = %task.kind, "Task added");
    state.events.task(EventAction::Create, &task).await;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(task))))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Task> {
    let task = state
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found("task", id))?;
    ok(task)
}

/// Update progress counters, then optionally finish the task through the
/// lock manager so its lease is released
async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateTaskRequest>,
) -> ApiResult<Task> {
    let failure = match request.status {
        None | Some(TaskStatus::Completed) => None,
        Some(TaskStatus::Failed) => Some(
            request
                .error
                .clone()
                .filter(|e| !e.trim().is_empty())
                .ok_or_else(|| ApiError::bad_request("error is required when failing a task"))?,
        ),
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "status can only be set to COMPLETED or FAILED, not {other}"
            )))
        }
    };

    let mut task = if request.progress.is_empty() {
        state
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| ApiError::not_found("task", id))?
    } else {
        let task = state.store.update_task_progress(id, &request.progress).await?;
        state.events.task(EventAction::Update, &task).await;
        task
    };

    if let Some(error) = failure {
        task = state.lock.fail_task(id, request.worker_id, error).await?;
    } else if request.status == Some(TaskStatus::Completed) {
        task = state
            .lock
            .complete_task(id, request.worker_id, task.videos_processed)
            .await?;
    }

    ok(task)
}

async fn delete_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Uuid> {
    if !state.store.delete_task(id).await? {
        return Err(ApiError::not_found("task", id));
    }

    if let Err(e) = state.lock.release_lease(id).await {
        tracing::warn!(task_id = %id, error = %e, "Lease release after delete failed, sweep will repair");
    }
    tracing::info!(task_id = %id, "Task deleted");
    state.events.task_deleted(id).await;

    ok(id)
}

/// Claim the next task; `data` is null when nothing is claimable
async fn claim_task(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequest>,
) -> ApiResult<Option<Task>> {
    ok(state.lock.claim_next(request.worker_id).await?)
}

/// Ingest a raw batch for a PROCESSING task and complete it.
///
/// Extraction and validation failures fail the task (422). Persistence
/// failures leave the task untouched (500). A COMPLETED task returns its
/// existing result.
async fn submit_results(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SubmitResultsRequest>,
) -> ApiResult<IngestReport> {
    let task = state
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found("task", id))?;

    match task.status {
        TaskStatus::Processing => {
            // Only the claimant may write the result
            if let (Some(worker_id), Some(owner)) = (request.worker_id, task.worker_id) {
                if worker_id != owner {
                    return Err(LockError::NotAssigned { id, worker_id }.into());
                }
            }
        }
        TaskStatus::Completed => {
            return match state.pipeline.ingest(id, &request.raw).await {
                Ok(report) => ok(report),
                Err(e) => Err(ApiError::conflict(format!(
                    "task {id} is already COMPLETED: {e}"
                ))),
            };
        }
        status => {
            return Err(ApiError::conflict(format!(
                "task {id} is {status}, expected PROCESSING"
            )))
        }
    }

    match state.pipeline.ingest(id, &request.raw).await {
        Ok(report) => {
            state
                .lock
                .complete_task(id, request.worker_id, report.result.total_videos)
                .await?;
            ok(report)
        }
        Err(e @ IngestError::Persist(_)) => Err(e.into()),
        Err(e) => {
            if let Err(fail_err) = state
                .lock
                .fail_task(id, request.worker_id, e.user_message())
                .await
            {
                tracing::warn!(task_id = %id, error = %fail_err, "Could not mark task FAILED after rejected batch");
            }
            Err(e.into())
        }
    }
}

async fn fail_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<FailTaskRequest>,
) -> ApiResult<Task> {
    let error = request.error.trim();
    if error.is_empty() {
        return Err(ApiError::bad_request("error must not be empty"));
    }
    ok(state.lock.fail_task(id, request.worker_id, error).await?)
}

// ============================================================================
// Result Handlers
// ============================================================================

async fn list_results(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Vec<ScrapeResult>> {
    let (limit, offset) = page(query.limit, query.offset);
    ok(state.store.list_results(limit, offset).await?)
}

async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ScrapeResult> {
    let result = state
        .store
        .get_result(id)
        .await?
        .ok_or_else(|| ApiError::not_found("result", id))?;
    ok(result)
}

// ============================================================================
// Worker Handlers
// ============================================================================

async fn register_worker(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Worker> {
    ok(state
        .control
        .register_worker(&request.name, &request.host)
        .await?)
}

async fn list_workers(State(state): State<AppState>) -> ApiResult<Vec<WorkerView>> {
    let threshold = state.stale_before();
    let workers = state
        .store
        .list_workers()
        .await?
        .into_iter()
        .map(|worker| WorkerView {
            stale: worker.is_stale(threshold),
            worker,
        })
        .collect();
    ok(workers)
}

async fn get_worker(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<WorkerView> {
    let worker = state
        .store
        .get_worker(id)
        .await?
        .ok_or_else(|| ApiError::not_found("worker", id))?;
    ok(WorkerView {
        stale: worker.is_stale(state.stale_before()),
        worker,
    })
}

async fn update_worker(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<WorkerUpdate>,
) -> ApiResult<Worker> {
    ok(state.control.update_worker(id, &update).await?)
}

async fn delete_worker(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Worker> {
    ok(state.control.delete_worker(id).await?)
}

async fn send_control(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ControlRequest>,
) -> ApiResult<ControlResponse> {
    let action: ControlAction = request
        .action
        .parse()
        .map_err(|e: crate::models::ParseEnumError| ApiError::bad_request(e.to_string()))?;

    let receivers = state.control.send_control(id, action).await?;
    ok(ControlResponse {
        worker_id: id,
        action,
        receivers,
    })
}

// ============================================================================
// Stats and Live Feed
// ============================================================================

async fn get_stats(State(state): State<AppState>) -> ApiResult<SystemStats> {
    ok(state.store.stats(state.stale_before()).await?)
}

/// Stream every domain event as Server-Sent Events, named by channel
async fn live_events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.events.subscribe_all().await?;

    let stream = ReceiverStream::new(subscription)
        .map(|msg| Ok(Event::default().event(msg.channel).data(msg.payload)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert!(response.data.is_some());
        assert!(response.error.is_none());
    }

    #[test]
    fn test_empty_claim_serializes_null_data() {
        let json = serde_json::to_value(ApiResponse::success(None::<Task>)).unwrap();
        assert_eq!(json["success"], true);
        assert!(json["data"].is_null());
        assert!(json.get("data").is_some());
    }

    #[test]
    fn test_page_bounds() {
        assert_eq!(page(None, None), (DEFAULT_PAGE_SIZE, 0));
        assert_eq!(page(Some(0), Some(-5)), (1, 0));
        assert_eq!(page(Some(10_000), Some(20)), (MAX_PAGE_SIZE, 20));
    }

    #[test]
    fn test_error_status_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(ApiError::from(LockError::TaskNotFound(id)).status, StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(LockError::InvalidState {
                id,
                status: TaskStatus::Pending
            })
            .status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(IngestError::NoValidRecords { rejected: 2 }).status,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(IngestError::Persist(StoreError::Pool("down".into()))).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(ControlError::MissingErrorMessage).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ControlError::WorkerNotFound(id)).status,
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_update_request_flattens_progress() {
        let request: UpdateTaskRequest =
            serde_json::from_value(serde_json::json!({"progress": 40, "status": "FAILED", "error": "boom"}))
                .unwrap();
        assert_eq!(request.progress.progress, Some(40));
        assert_eq!(request.status, Some(TaskStatus::Failed));
    }
}

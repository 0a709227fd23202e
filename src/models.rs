//! Core data structures shared by the coordinator, workers and the ingestion pipeline
//!
//! The durable entities are [`Task`], [`Worker`], [`ScrapeResult`] and its
//! [`VideoRecord`] children. Leases never appear here; they only live in the
//! coordination store (see [`crate::lock`]).

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fallback subject when a task URL carries no `/@name` segment
pub const UNKNOWN_SUBJECT: &str = "unknown";

// ============================================================================
// Task
// ============================================================================

/// What a task points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskKind {
    Profile,
    Video,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Profile => "PROFILE",
            TaskKind::Video => "VIDEO",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PROFILE" => Ok(TaskKind::Profile),
            "VIDEO" => Ok(TaskKind::Video),
            _ => Err(ParseEnumError::new("task kind", s)),
        }
    }
}

/// Task lifecycle status
///
/// Transitions are monotonic: `PENDING -> PROCESSING -> {COMPLETED, FAILED}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// COMPLETED and FAILED are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether moving from `self` to `next` respects the monotonic lifecycle
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(ParseEnumError::new("task status", s)),
        }
    }
}

/// One unit of scraping work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub url: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: i32,
    pub videos_found: i32,
    pub videos_processed: i32,
    pub worker_id: Option<Uuid>,
    pub error: Option<String>,
}

impl Task {
    /// Create a new PENDING task
    pub fn new(url: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            kind,
            status: TaskStatus::Pending,
            added_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0,
            videos_found: 0,
            videos_processed: 0,
            worker_id: None,
            error: None,
        }
    }

    /// Subject (account name) the task URL refers to
    pub fn subject_identifier(&self) -> String {
        subject_from_url(&self.url).unwrap_or_else(|| UNKNOWN_SUBJECT.to_string())
    }
}

/// Request body for creating a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub url: String,
    #[serde(default)]
    pub kind: Option<TaskKind>,
}

/// Progress counters reported while a task runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub videos_found: Option<i32>,
    #[serde(default)]
    pub videos_processed: Option<i32>,
}

impl TaskProgress {
    pub fn is_empty(&self) -> bool {
        self.progress.is_none() && self.videos_found.is_none() && self.videos_processed.is_none()
    }
}

/// Extract the `@name` segment from a profile or video URL
pub fn subject_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/@")?;
    let name = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn target_patterns() -> &'static [(Regex, TaskKind)] {
    static PATTERNS: OnceLock<Vec<(Regex, TaskKind)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"^https?://(www\.)?tiktok\.com/@[\w.\-]+/video/\d+", TaskKind::Video),
            (r"^https?://(www\.)?tiktok\.com/t/\w+", TaskKind::Video),
            (r"^https?://vm\.tiktok\.com/\w+", TaskKind::Video),
            (r"^https?://(www\.)?tiktok\.com/@[\w.\-]+/?(\?.*)?$", TaskKind::Profile),
        ]
        .into_iter()
        .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
        .collect()
    })
}

/// Classify a target URL, returning `None` when it is not a recognized link
pub fn detect_task_kind(url: &str) -> Option<TaskKind> {
    let url = url.trim();
    target_patterns()
        .iter()
        .find(|(re, _)| re.is_match(url))
        .map(|(_, kind)| *kind)
}

// ============================================================================
// Worker
// ============================================================================

/// Worker lifecycle status as persisted and reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkerStatus {
    Idle,
    Running,
    Paused,
    Error,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 4] = [
        WorkerStatus::Idle,
        WorkerStatus::Running,
        WorkerStatus::Paused,
        WorkerStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Running => "RUNNING",
            WorkerStatus::Paused => "PAUSED",
            WorkerStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDLE" => Ok(WorkerStatus::Idle),
            "RUNNING" => Ok(WorkerStatus::Running),
            "PAUSED" => Ok(WorkerStatus::Paused),
            "ERROR" => Ok(WorkerStatus::Error),
            _ => Err(ParseEnumError::new("worker status", s)),
        }
    }
}

/// A registered scraping worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub host: String,
    pub status: WorkerStatus,
    pub processed_count: i64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub current_task_id: Option<Uuid>,
    pub error_message: Option<String>,
}

impl Worker {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            host: host.into(),
            status: WorkerStatus::Idle,
            processed_count: 0,
            started_at: now,
            last_activity: now,
            current_task_id: None,
            error_message: None,
        }
    }

    /// No status snapshot since `threshold`
    pub fn is_stale(&self, threshold: DateTime<Utc>) -> bool {
        self.last_activity < threshold
    }
}

/// Partial update applied to a worker row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerUpdate {
    #[serde(default)]
    pub status: Option<WorkerStatus>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub processed_count: Option<i64>,
}

/// Liveness data persisted from a worker status snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub status: WorkerStatus,
    pub processed_count: i64,
    pub current_task_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Result + VideoRecord
// ============================================================================

/// Derived engagement ratios for one video
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EngagementMetrics {
    pub engagement_rate: f64,
    pub likes_per_view: f64,
    pub comments_per_view: f64,
    pub bookmarks_per_view: f64,
}

/// Independent content category flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentCategories {
    pub has_music: bool,
    pub has_dance: bool,
    pub has_comedy: bool,
    pub has_educational: bool,
    pub has_trending_hashtags: bool,
}

/// A cleaned, validated, scored video ready to be persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoDraft {
    pub video_id: String,
    pub url: String,
    pub description: String,
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
    /// Bookmark counter, persisted in the `shares` column
    pub shares: i64,
    pub duration: Option<String>,
    pub upload_date: Option<DateTime<Utc>>,
    pub hashtags: Vec<String>,
    pub mentions: Vec<String>,
    pub comment_texts: Vec<String>,
    pub metrics: EngagementMetrics,
    pub categories: ContentCategories,
}

/// Persisted per-video child row of a [`ScrapeResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: Uuid,
    pub result_id: Uuid,
    pub video_id: String,
    pub url: String,
    pub description: String,
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub duration: Option<String>,
    pub upload_date: Option<DateTime<Utc>>,
    pub hashtags: Vec<String>,
    pub mentions: Vec<String>,
    pub comment_texts: Vec<String>,
    pub metrics: EngagementMetrics,
    pub categories: ContentCategories,
    pub created_at: DateTime<Utc>,
}

impl VideoRecord {
    pub fn from_draft(result_id: Uuid, draft: VideoDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            result_id,
            video_id: draft.video_id,
            url: draft.url,
            description: draft.description,
            views: draft.views,
            likes: draft.likes,
            comments: draft.comments,
            shares: draft.shares,
            duration: draft.duration,
            upload_date: draft.upload_date,
            hashtags: draft.hashtags,
            mentions: draft.mentions,
            comment_texts: draft.comment_texts,
            metrics: draft.metrics,
            categories: draft.categories,
            created_at,
        }
    }
}

/// Durable outcome of one completed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub url: String,
    pub subject: String,
    pub total_videos: i32,
    pub successful_videos: i32,
    pub failed_videos: i32,
    pub completed_at: DateTime<Utc>,
    pub processing_time_ms: i64,
    pub videos: Vec<VideoRecord>,
}

impl ScrapeResult {
    /// Assemble a result for `task` from validated drafts
    pub fn assemble(task: &Task, drafts: Vec<VideoDraft>, completed_at: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        let processing_time_ms = task
            .started_at
            .map(|started| (completed_at - started).num_milliseconds().max(0))
            .unwrap_or(0);
        let videos: Vec<VideoRecord> = drafts
            .into_iter()
            .map(|d| VideoRecord::from_draft(id, d, completed_at))
            .collect();
        let count = i32::try_from(videos.len()).unwrap_or(i32::MAX);

        Self {
            id,
            task_id: task.id,
            url: task.url.clone(),
            subject: task.subject_identifier(),
            total_videos: count,
            successful_videos: count,
            failed_videos: 0,
            completed_at,
            processing_time_ms,
            videos,
        }
    }
}

/// Outcome of a result write; `created` is false when a result already existed
#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub result: ScrapeResult,
    pub created: bool,
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub idle: u64,
    pub running: u64,
    pub paused: u64,
    pub error: u64,
    pub stale: u64,
    pub total: u64,
}

/// Aggregate view surfaced on `/api/stats` and the stats channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStats {
    pub tasks: TaskCounts,
    pub workers: WorkerCounts,
    pub total_results: u64,
    pub total_videos: u64,
}

// ============================================================================
// Parse errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {what}: {value}")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

impl ParseEnumError {
    pub fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

//! PostgreSQL state store
//!
//! Connection pooling via deadpool-postgres. Claiming and finishing tasks use
//! single conditional `UPDATE ... WHERE status = ...` statements; result
//! ingestion runs in one transaction that locks the originating task row.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{
    Config as PoolConfig, GenericClient, ManagerConfig, Pool, RecyclingMethod, Runtime,
};
use serde::{Deserialize, Serialize};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use super::{StateStore, StoreError, TaskFilter, TaskOutcome, DEFAULT_PAGE_SIZE};
use crate::models::{
    ContentCategories, EngagementMetrics, Heartbeat, PersistOutcome, ScrapeResult, SystemStats,
    Task, TaskProgress, TaskStatus, VideoDraft, VideoRecord, Worker, WorkerStatus, WorkerUpdate,
};

/// Schema applied by `scrapefleet migrate` and on coordinator start
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS task (
    id               UUID PRIMARY KEY,
    url              TEXT NOT NULL,
    kind             TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'PENDING',
    added_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at       TIMESTAMPTZ,
    completed_at     TIMESTAMPTZ,
    progress         INTEGER NOT NULL DEFAULT 0,
    videos_found     INTEGER NOT NULL DEFAULT 0,
    videos_processed INTEGER NOT NULL DEFAULT 0,
    worker_id        UUID,
    error            TEXT
);

CREATE INDEX IF NOT EXISTS idx_task_status_added ON task (status, added_at);

CREATE TABLE IF NOT EXISTS worker (
    id              UUID PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    host            TEXT NOT NULL DEFAULT '',
    status          TEXT NOT NULL DEFAULT 'IDLE',
    processed_count BIGINT NOT NULL DEFAULT 0,
    started_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_activity   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    current_task_id UUID,
    error_message   TEXT
);

CREATE TABLE IF NOT EXISTS result (
    id                 UUID PRIMARY KEY,
    task_id            UUID NOT NULL UNIQUE REFERENCES task (id) ON DELETE CASCADE,
    url                TEXT NOT NULL,
    subject            TEXT NOT NULL,
    total_videos       INTEGER NOT NULL,
    successful_videos  INTEGER NOT NULL,
    failed_videos      INTEGER NOT NULL,
    completed_at       TIMESTAMPTZ NOT NULL,
    processing_time_ms BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_result_completed ON result (completed_at DESC);

CREATE TABLE IF NOT EXISTS video_record (
    id                    UUID PRIMARY KEY,
    result_id             UUID NOT NULL REFERENCES result (id) ON DELETE CASCADE,
    video_id              TEXT NOT NULL,
    url                   TEXT NOT NULL,
    description           TEXT NOT NULL DEFAULT '',
    likes                 BIGINT NOT NULL DEFAULT 0,
    shares                BIGINT NOT NULL DEFAULT 0,
    comments              BIGINT NOT NULL DEFAULT 0,
    views                 BIGINT NOT NULL DEFAULT 0,
    duration              TEXT,
    upload_date           TIMESTAMPTZ,
    hashtags              TEXT[] NOT NULL DEFAULT '{}',
    mentions              TEXT[] NOT NULL DEFAULT '{}',
    comment_texts         TEXT[] NOT NULL DEFAULT '{}',
    engagement_rate       DOUBLE PRECISION NOT NULL DEFAULT 0,
    likes_per_view        DOUBLE PRECISION NOT NULL DEFAULT 0,
    comments_per_view     DOUBLE PRECISION NOT NULL DEFAULT 0,
    bookmarks_per_view    DOUBLE PRECISION NOT NULL DEFAULT 0,
    has_music             BOOLEAN NOT NULL DEFAULT FALSE,
    has_dance             BOOLEAN NOT NULL DEFAULT FALSE,
    has_comedy            BOOLEAN NOT NULL DEFAULT FALSE,
    has_educational       BOOLEAN NOT NULL DEFAULT FALSE,
    has_trending_hashtags BOOLEAN NOT NULL DEFAULT FALSE,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (result_id, video_id)
);
"#;

const TASK_COLUMNS: &str = "id, url, kind, status, added_at, started_at, completed_at, \
     progress, videos_found, videos_processed, worker_id, error";

const WORKER_COLUMNS: &str = "id, name, host, status, processed_count, started_at, \
     last_activity, current_task_id, error_message";

const RESULT_COLUMNS: &str = "id, task_id, url, subject, total_videos, successful_videos, \
     failed_videos, completed_at, processing_time_ms";

const VIDEO_COLUMNS: &str = "id, result_id, video_id, url, description, likes, shares, \
     comments, views, duration, upload_date, hashtags, mentions, comment_texts, \
     engagement_rate, likes_per_view, comments_per_view, bookmarks_per_view, has_music, \
     has_dance, has_comedy, has_educational, has_trending_hashtags, created_at";

// ============================================================================
// Configuration
// ============================================================================

/// PostgreSQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum pool size
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/scrapefleet".to_string(),
            pool_size: 10,
        }
    }
}

impl DatabaseConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/scrapefleet".to_string()),
            pool_size: std::env::var("DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL implementation of [`StateStore`]
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Create the pool and verify connectivity
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut pool_config = PoolConfig::new();
        pool_config.url = Some(config.url.clone());
        pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pool_config.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(format!("failed to create pool: {e}")))?;

        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;

        tracing::info!(pool_size = config.pool_size, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA_SQL).await?;
        tracing::info!("Database schema is up to date");
        Ok(())
    }

    async fn load_videos<C: GenericClient>(
        client: &C,
        result_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<VideoRecord>>, StoreError> {
        let mut grouped: HashMap<Uuid, Vec<VideoRecord>> = HashMap::new();
        if result_ids.is_empty() {
            return Ok(grouped);
        }
        let ids: Vec<Uuid> = result_ids.to_vec();
        let query = format!(
            "SELECT {VIDEO_COLUMNS} FROM video_record WHERE result_id = ANY($1) ORDER BY created_at, video_id"
        );
        for row in client.query(&query, &[&ids]).await? {
            let video = video_from_row(&row)?;
            grouped.entry(video.result_id).or_default().push(video);
        }
        Ok(grouped)
    }

    async fn attach_videos<C: GenericClient>(
        client: &C,
        mut results: Vec<ScrapeResult>,
    ) -> Result<Vec<ScrapeResult>, StoreError> {
        let ids: Vec<Uuid> = results.iter().map(|r| r.id).collect();
        let mut videos = Self::load_videos(client, &ids).await?;
        for result in &mut results {
            result.videos = videos.remove(&result.id).unwrap_or_default();
        }
        Ok(results)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_enum<T: std::str::FromStr>(value: String) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn task_from_row(row: &Row) -> Result<Task, StoreError> {
    Ok(Task {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        kind: parse_enum(row.try_get("kind")?)?,
        status: parse_enum(row.try_get("status")?)?,
        added_at: row.try_get("added_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        progress: row.try_get("progress")?,
        videos_found: row.try_get("videos_found")?,
        videos_processed: row.try_get("videos_processed")?,
        worker_id: row.try_get("worker_id")?,
        error: row.try_get("error")?,
    })
}

fn worker_from_row(row: &Row) -> Result<Worker, StoreError> {
    Ok(Worker {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        host: row.try_get("host")?,
        status: parse_enum(row.try_get("status")?)?,
        processed_count: row.try_get("processed_count")?,
        started_at: row.try_get("started_at")?,
        last_activity: row.try_get("last_activity")?,
        current_task_id: row.try_get("current_task_id")?,
        error_message: row.try_get("error_message")?,
    })
}

fn result_from_row(row: &Row) -> Result<ScrapeResult, StoreError> {
    Ok(ScrapeResult {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        url: row.try_get("url")?,
        subject: row.try_get("subject")?,
        total_videos: row.try_get("total_videos")?,
        successful_videos: row.try_get("successful_videos")?,
        failed_videos: row.try_get("failed_videos")?,
        completed_at: row.try_get("completed_at")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        videos: Vec::new(),
    })
}

fn video_from_row(row: &Row) -> Result<VideoRecord, StoreError> {
    Ok(VideoRecord {
        id: row.try_get("id")?,
        result_id: row.try_get("result_id")?,
        video_id: row.try_get("video_id")?,
        url: row.try_get("url")?,
        description: row.try_get("description")?,
        views: row.try_get("views")?,
        likes: row.try_get("likes")?,
        comments: row.try_get("comments")?,
        shares: row.try_get("shares")?,
        duration: row.try_get("duration")?,
        upload_date: row.try_get("upload_date")?,
        hashtags: row.try_get("hashtags")?,
        mentions: row.try_get("mentions")?,
        comment_texts: row.try_get("comment_texts")?,
        metrics: EngagementMetrics {
            engagement_rate: row.try_get("engagement_rate")?,
            likes_per_view: row.try_get("likes_per_view")?,
            comments_per_view: row.try_get("comments_per_view")?,
            bookmarks_per_view: row.try_get("bookmarks_per_view")?,
        },
        categories: ContentCategories {
            has_music: row.try_get("has_music")?,
            has_dance: row.try_get("has_dance")?,
            has_comedy: row.try_get("has_comedy")?,
            has_educational: row.try_get("has_educational")?,
            has_trending_hashtags: row.try_get("has_trending_hashtags")?,
        },
        created_at: row.try_get("created_at")?,
    })
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

// ============================================================================
// StateStore implementation
// ============================================================================

#[async_trait]
impl StateStore for PostgresStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let inserted = client
            .execute(
                "INSERT INTO task (id, url, kind, status, added_at, progress, videos_found, videos_processed)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &task.id,
                    &task.url,
                    &task.kind.as_str(),
                    &task.status.as_str(),
                    &task.added_at,
                    &task.progress,
                    &task.videos_found,
                    &task.videos_processed,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {TASK_COLUMNS} FROM task WHERE id = $1");
        client
            .query_opt(&query, &[&id])
            .await?
            .map(|row| task_from_row(&row))
            .transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let client = self.pool.get().await?;
        let status = filter.status.map(|s| s.as_str());
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let offset = filter.offset.unwrap_or(0);
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM task
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY added_at DESC
             LIMIT $2 OFFSET $3"
        );
        client
            .query(&query, &[&status, &limit, &offset])
            .await?
            .iter()
            .map(task_from_row)
            .collect()
    }

    async fn update_task_progress(
        &self,
        id: Uuid,
        progress: &TaskProgress,
    ) -> Result<Task, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "UPDATE task SET
                progress = COALESCE($2, progress),
                videos_found = COALESCE($3, videos_found),
                videos_processed = COALESCE($4, videos_processed)
             WHERE id = $1
             RETURNING {TASK_COLUMNS}"
        );
        let row = client
            .query_opt(
                &query,
                &[
                    &id,
                    &progress.progress,
                    &progress.videos_found,
                    &progress.videos_processed,
                ],
            )
            .await?
            .ok_or_else(|| StoreError::not_found("task", id))?;
        task_from_row(&row)
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let deleted = client.execute("DELETE FROM task WHERE id = $1", &[&id]).await?;
        Ok(deleted > 0)
    }

    async fn pending_candidates(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM task
             WHERE status = 'PENDING'
             ORDER BY added_at ASC, id ASC
             LIMIT $1"
        );
        client
            .query(&query, &[&limit])
            .await?
            .iter()
            .map(task_from_row)
            .collect()
    }

    async fn mark_processing(
        &self,
        id: Uuid,
        worker_id: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "UPDATE task SET status = 'PROCESSING', started_at = $2, worker_id = $3
             WHERE id = $1 AND status = 'PENDING'
             RETURNING {TASK_COLUMNS}"
        );
        client
            .query_opt(&query, &[&id, &at, &worker_id])
            .await?
            .map(|row| task_from_row(&row))
            .transpose()
    }

    async fn finish_task(
        &self,
        id: Uuid,
        outcome: &TaskOutcome,
        expected_worker: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let client = self.pool.get().await?;
        let status = outcome.status().as_str();
        let error = outcome.error();
        let videos = outcome.videos();
        let query = format!(
            "UPDATE task SET
                status = $2::text,
                completed_at = $3,
                error = $4,
                progress = CASE WHEN $5::int IS NULL THEN progress ELSE 100 END,
                videos_found = COALESCE($5::int, videos_found),
                videos_processed = COALESCE($5::int, videos_processed)
             WHERE id = $1
               AND status = 'PROCESSING'
               AND ($6::uuid IS NULL OR worker_id IS NULL OR worker_id = $6)
             RETURNING {TASK_COLUMNS}"
        );
        client
            .query_opt(&query, &[&id, &status, &at, &error, &videos, &expected_worker])
            .await?
            .map(|row| task_from_row(&row))
            .transpose()
    }

    async fn task_status(&self, id: Uuid) -> Result<Option<TaskStatus>, StoreError> {
        let client = self.pool.get().await?;
        client
            .query_opt("SELECT status FROM task WHERE id = $1", &[&id])
            .await?
            .map(|row| parse_enum(row.try_get("status")?))
            .transpose()
    }

    async fn stale_processing(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM task
             WHERE status = 'PROCESSING' AND started_at < $1
             ORDER BY started_at ASC"
        );
        client
            .query(&query, &[&started_before])
            .await?
            .iter()
            .map(task_from_row)
            .collect()
    }

    async fn register_worker(&self, name: &str, host: &str) -> Result<Worker, StoreError> {
        let client = self.pool.get().await?;
        let now = Utc::now();
        let query = format!(
            "INSERT INTO worker (id, name, host, status, processed_count, started_at, last_activity)
             VALUES ($1, $2, $3, 'IDLE', 0, $4, $4)
             ON CONFLICT (name) DO UPDATE SET
                host = EXCLUDED.host,
                status = 'IDLE',
                started_at = EXCLUDED.started_at,
                last_activity = EXCLUDED.last_activity,
                current_task_id = NULL,
                error_message = NULL
             RETURNING {WORKER_COLUMNS}"
        );
        let row = client
            .query_one(&query, &[&Uuid::new_v4(), &name, &host, &now])
            .await?;
        worker_from_row(&row)
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {WORKER_COLUMNS} FROM worker WHERE id = $1");
        client
            .query_opt(&query, &[&id])
            .await?
            .map(|row| worker_from_row(&row))
            .transpose()
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {WORKER_COLUMNS} FROM worker ORDER BY name");
        client
            .query(&query, &[])
            .await?
            .iter()
            .map(worker_from_row)
            .collect()
    }

    async fn update_worker(
        &self,
        id: Uuid,
        update: &WorkerUpdate,
    ) -> Result<Option<Worker>, StoreError> {
        let client = self.pool.get().await?;
        let status = update.status.map(|s| s.as_str());
        let query = format!(
            "UPDATE worker SET
                status = COALESCE($2::text, status),
                error_message = CASE
                    WHEN $2::text IS NOT NULL AND $2::text <> 'ERROR' THEN NULL
                    ELSE COALESCE($3, error_message)
                END,
                processed_count = COALESCE($4, processed_count),
                last_activity = $5
             WHERE id = $1
             RETURNING {WORKER_COLUMNS}"
        );
        client
            .query_opt(
                &query,
                &[
                    &id,
                    &status,
                    &update.error_message,
                    &update.processed_count,
                    &Utc::now(),
                ],
            )
            .await?
            .map(|row| worker_from_row(&row))
            .transpose()
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        heartbeat: &Heartbeat,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE worker SET
                    status = $2,
                    processed_count = $3,
                    current_task_id = $4,
                    error_message = $5,
                    last_activity = $6
                 WHERE id = $1",
                &[
                    &id,
                    &heartbeat.status.as_str(),
                    &heartbeat.processed_count,
                    &heartbeat.current_task_id,
                    &heartbeat.error_message,
                    &heartbeat.at,
                ],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn delete_worker(&self, id: Uuid) -> Result<Option<Worker>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!("DELETE FROM worker WHERE id = $1 RETURNING {WORKER_COLUMNS}");
        client
            .query_opt(&query, &[&id])
            .await?
            .map(|row| worker_from_row(&row))
            .transpose()
    }

    async fn persist_result(
        &self,
        task_id: Uuid,
        drafts: Vec<VideoDraft>,
    ) -> Result<PersistOutcome, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let task_query = format!("SELECT {TASK_COLUMNS} FROM task WHERE id = $1 FOR UPDATE");
        let task = tx
            .query_opt(&task_query, &[&task_id])
            .await?
            .map(|row| task_from_row(&row))
            .transpose()?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        let existing_query = format!("SELECT {RESULT_COLUMNS} FROM result WHERE task_id = $1");
        if let Some(row) = tx.query_opt(&existing_query, &[&task_id]).await? {
            let existing = result_from_row(&row)?;
            let mut attached = Self::attach_videos(&tx, vec![existing]).await?;
            tx.commit().await?;
            let result = attached
                .pop()
                .ok_or_else(|| StoreError::Corrupt("result vanished while loading".into()))?;
            return Ok(PersistOutcome {
                result,
                created: false,
            });
        }

        let result = ScrapeResult::assemble(&task, drafts, Utc::now());

        tx.execute(
            "INSERT INTO result (id, task_id, url, subject, total_videos, successful_videos,
                                 failed_videos, completed_at, processing_time_ms)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &result.id,
                &result.task_id,
                &result.url,
                &result.subject,
                &result.total_videos,
                &result.successful_videos,
                &result.failed_videos,
                &result.completed_at,
                &result.processing_time_ms,
            ],
        )
        .await?;

        let insert_video = tx
            .prepare(
                "INSERT INTO video_record (id, result_id, video_id, url, description, likes, shares,
                     comments, views, duration, upload_date, hashtags, mentions, comment_texts,
                     engagement_rate, likes_per_view, comments_per_view, bookmarks_per_view,
                     has_music, has_dance, has_comedy, has_educational, has_trending_hashtags,
                     created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                         $17, $18, $19, $20, $21, $22, $23, $24)",
            )
            .await?;

        for v in &result.videos {
            tx.execute(
                &insert_video,
                &[
                    &v.id,
                    &v.result_id,
                    &v.video_id,
                    &v.url,
                    &v.description,
                    &v.likes,
                    &v.shares,
                    &v.comments,
                    &v.views,
                    &v.duration,
                    &v.upload_date,
                    &v.hashtags,
                    &v.mentions,
                    &v.comment_texts,
                    &v.metrics.engagement_rate,
                    &v.metrics.likes_per_view,
                    &v.metrics.comments_per_view,
                    &v.metrics.bookmarks_per_view,
                    &v.categories.has_music,
                    &v.categories.has_dance,
                    &v.categories.has_comedy,
                    &v.categories.has_educational,
                    &v.categories.has_trending_hashtags,
                    &v.created_at,
                ],
            )
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            task_id = %task_id,
            result_id = %result.id,
            videos = result.videos.len(),
            "Result committed"
        );

        Ok(PersistOutcome {
            result,
            created: true,
        })
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<ScrapeResult>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {RESULT_COLUMNS} FROM result WHERE id = $1");
        let Some(row) = client.query_opt(&query, &[&id]).await? else {
            return Ok(None);
        };
        let result = result_from_row(&row)?;
        Ok(Self::attach_videos(&client, vec![result]).await?.pop())
    }

    async fn list_results(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ScrapeResult>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {RESULT_COLUMNS} FROM result ORDER BY completed_at DESC LIMIT $1 OFFSET $2"
        );
        let results = client
            .query(&query, &[&limit, &offset])
            .await?
            .iter()
            .map(result_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Self::attach_videos(&client, results).await
    }

    async fn stats(&self, stale_before: DateTime<Utc>) -> Result<SystemStats, StoreError> {
        let client = self.pool.get().await?;
        let mut stats = SystemStats::default();

        for row in client
            .query("SELECT status, COUNT(*) AS n FROM task GROUP BY status", &[])
            .await?
        {
            let status: TaskStatus = parse_enum(row.try_get("status")?)?;
            let n = count(row.try_get("n")?);
            stats.tasks.total += n;
            match status {
                TaskStatus::Pending => stats.tasks.pending = n,
                TaskStatus::Processing => stats.tasks.processing = n,
                TaskStatus::Completed => stats.tasks.completed = n,
                TaskStatus::Failed => stats.tasks.failed = n,
            }
        }

        for row in client
            .query("SELECT status, COUNT(*) AS n FROM worker GROUP BY status", &[])
            .await?
        {
            let status: WorkerStatus = parse_enum(row.try_get("status")?)?;
            let n = count(row.try_get("n")?);
            stats.workers.total += n;
            match status {
                WorkerStatus::Idle => stats.workers.idle = n,
                WorkerStatus::Running => stats.workers.running = n,
                WorkerStatus::Paused => stats.workers.paused = n,
                WorkerStatus::Error => stats.workers.error = n,
            }
        }

        let row = client
            .query_one(
                "SELECT
                    (SELECT COUNT(*) FROM worker WHERE last_activity < $1) AS stale,
                    (SELECT COUNT(*) FROM result) AS results,
                    (SELECT COUNT(*) FROM video_record) AS videos",
                &[&stale_before],
            )
            .await?;
        stats.workers.stale = count(row.try_get("stale")?);
        stats.total_results = count(row.try_get("results")?);
        stats.total_videos = count(row.try_get("videos")?);

        Ok(stats)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

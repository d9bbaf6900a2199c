use chrono::{DateTime, Duration, Utc};
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::import::error::StoreError;
use crate::import::run::{ActorId, ImportRequest};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "import_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ImportJob {
    pub id: i32,
    pub actor_id: ActorId,
    pub payload: Value,
    pub attempts: i32,
}

impl ImportJob {
    pub fn request(&self) -> Result<ImportRequest, StoreError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// How long a running job may go without a heartbeat before it is
/// considered abandoned.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 120;

/// Postgres-backed queue of background import invocations. A paused run is
/// rescheduled rather than slept on, so no worker is held across a pause.
///
/// Running jobs send heartbeats. A job whose heartbeat goes stale belongs to
/// a worker that died; it no longer counts as active and is put back in the
/// queue by [`ImportJobQueue::requeue_stale_jobs`].
#[derive(Clone)]
pub struct ImportJobQueue {
    pool: PgPool,
    stale_after: Duration,
}

impl ImportJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
        }
    }

    pub fn with_stale_after(mut self, stale_after: std::time::Duration) -> Self {
        if let Ok(stale_after) = Duration::from_std(stale_after) {
            self.stale_after = stale_after;
        }
        self
    }

    fn stale_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - self.stale_after
    }

    /// Enqueue an invocation for `actor`, runnable immediately.
    pub async fn enqueue(
        &self,
        actor: &ActorId,
        request: &ImportRequest,
    ) -> Result<i32, StoreError> {
        let payload = serde_json::to_value(request)?;
        let (id,): (i32,) = sqlx::query_as(
            r#"INSERT INTO import_jobs (actor_id, payload)
               VALUES ($1, $2)
               RETURNING id"#,
        )
        .bind(actor)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Queued job, or running job with a live heartbeat, for `actor`.
    pub async fn active_job(&self, actor: &ActorId) -> Result<Option<i32>, StoreError> {
        let id: Option<(i32,)> = sqlx::query_as(
            r#"SELECT id FROM import_jobs
               WHERE actor_id = $1
                 AND (status = 'queued'
                      OR (status = 'running' AND last_heartbeat >= $2))
               ORDER BY created_at ASC
               LIMIT 1"#,
        )
        .bind(actor)
        .bind(self.stale_cutoff())
        .fetch_optional(&self.pool)
        .await?;

        Ok(id.map(|(id,)| id))
    }

    /// Claim the next due job atomically (SELECT FOR UPDATE SKIP LOCKED)
    pub async fn get_next_job(&self) -> Result<Option<ImportJob>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let job: Option<(i32, ActorId, Value)> = sqlx::query_as(
            r#"SELECT id, actor_id, payload FROM import_jobs
               WHERE status = 'queued' AND run_after <= NOW()
               ORDER BY run_after ASC, created_at ASC
               LIMIT 1
               FOR UPDATE SKIP LOCKED"#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, actor_id, payload)) = job else {
            return Ok(None);
        };

        let (attempts,): (i32,) = sqlx::query_as(
            r#"UPDATE import_jobs
               SET status = 'running', started_at = COALESCE(started_at, NOW()),
                   attempts = attempts + 1, last_heartbeat = NOW()
               WHERE id = $1
               RETURNING attempts"#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(ImportJob {
            id,
            actor_id,
            payload,
            attempts,
        }))
    }

    /// Record that a running job is still alive.
    pub async fn heartbeat(&self, job_id: i32) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE import_jobs SET last_heartbeat = NOW() WHERE id = $1 AND status = 'running'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Put every running job back in the queue. Only safe while no worker of
    /// this queue is alive, i.e. before the dispatcher starts.
    pub async fn requeue_running_jobs(&self) -> Result<u64, StoreError> {
        self.requeue_running(None).await
    }

    /// Put running jobs whose heartbeat went stale back in the queue.
    pub async fn requeue_stale_jobs(&self) -> Result<u64, StoreError> {
        self.requeue_running(Some(self.stale_cutoff())).await
    }

    async fn requeue_running(
        &self,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"UPDATE import_jobs
               SET status = 'queued', run_after = NOW()
               WHERE status = 'running'
                 AND ($1::timestamptz IS NULL
                      OR last_heartbeat IS NULL
                      OR last_heartbeat < $1)"#,
        )
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Mark job complete
    pub async fn complete_job(&self, job_id: i32) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE import_jobs SET status = 'succeeded', completed_at = NOW(), last_heartbeat = NOW() WHERE id = $1 AND status = 'running'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark job failed
    pub async fn fail_job(&self, job_id: i32, error: String) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE import_jobs SET status = 'failed', completed_at = NOW(), error_message = $1, last_heartbeat = NOW() WHERE id = $2 AND status = 'running'",
        )
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Put a running job back in the queue, not runnable before `run_after`.
    pub async fn reschedule(
        &self,
        job_id: i32,
        run_after: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE import_jobs
               SET status = 'queued', run_after = $1, last_heartbeat = NOW()
               WHERE id = $2 AND status = 'running'"#,
        )
        .bind(run_after)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn cancel_job(&self, job_id: i32) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE import_jobs
               SET status = 'cancelled', completed_at = NOW()
               WHERE id = $1 AND status IN ('queued', 'running')"#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Cancel every queued or running job of `actor`.
    pub async fn cancel_actor_jobs(&self, actor: &ActorId) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"UPDATE import_jobs
               SET status = 'cancelled', completed_at = NOW(), error_message = 'Cancelled by user'
               WHERE actor_id = $1 AND status IN ('queued', 'running')"#,
        )
        .bind(actor)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Jobs of `actor`, newest first.
    pub async fn jobs_for_actor(&self, actor: &ActorId) -> Result<Vec<JobStatusInfo>, StoreError> {
        let jobs = sqlx::query_as(
            r#"SELECT id, actor_id, status, attempts, run_after, created_at,
                      started_at, completed_at, error_message
               FROM import_jobs
               WHERE actor_id = $1
               ORDER BY created_at DESC
               LIMIT 20"#,
        )
        .bind(actor)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, JsonSchema)]
pub struct JobStatusInfo {
    pub id: i32,
    #[serde(rename = "actorId")]
    pub actor_id: ActorId,
    pub status: JobStatus,
    pub attempts: i32,
    #[serde(rename = "runAfter")]
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

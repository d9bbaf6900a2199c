//! Per-actor run checkpoints.
//!
//! Every write of an in-flight run is conditional on the generation it was
//! loaded under. Restart and stop bump the generation, which fences off any
//! invocation still holding the previous one.

use async_trait::async_trait;
use rocket_db_pools::sqlx::{self, PgPool};

use crate::import::error::StoreError;
use crate::import::run::{ActorId, ImportRun};
use crate::import::store::CheckpointStore;

const RUN_COLUMNS: &str = "actor_id, generation, last_success_row, images_downloaded, total_rows, \
     status, pause_until, pause_minutes, extra_delay_minutes, error_message, started_at, updated_at";

#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn find(&self, actor: &ActorId) -> Result<Option<ImportRun>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM import_runs WHERE actor_id = $1");
        let run = sqlx::query_as::<_, ImportRun>(&sql)
            .bind(actor)
            .fetch_optional(&self.pool)
            .await?;

        Ok(run)
    }

    async fn get_or_create(
        &self,
        actor: &ActorId,
        pause_minutes: i32,
    ) -> Result<ImportRun, StoreError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let sql = format!(
            r#"INSERT INTO import_runs (actor_id, pause_minutes)
               VALUES ($1, $2)
               ON CONFLICT (actor_id) DO UPDATE SET actor_id = EXCLUDED.actor_id
               RETURNING {RUN_COLUMNS}"#
        );
        let run = sqlx::query_as::<_, ImportRun>(&sql)
            .bind(actor)
            .bind(pause_minutes)
            .fetch_one(&self.pool)
            .await?;

        Ok(run)
    }

    async fn save(&self, run: &ImportRun) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE import_runs
               SET last_success_row = $3,
                   images_downloaded = $4,
                   total_rows = $5,
                   status = $6,
                   pause_until = $7,
                   pause_minutes = $8,
                   extra_delay_minutes = $9,
                   error_message = $10,
                   updated_at = NOW()
               WHERE actor_id = $1 AND generation = $2"#,
        )
        .bind(&run.actor_id)
        .bind(run.generation)
        .bind(run.last_success_row)
        .bind(run.images_downloaded)
        .bind(run.total_rows)
        .bind(run.status)
        .bind(run.pause_until)
        .bind(run.pause_minutes)
        .bind(run.extra_delay_minutes)
        .bind(run.error_message.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            log::debug!(
                "actor {}: checkpoint for generation {} superseded",
                run.actor_id,
                run.generation
            );
        }
        Ok(result.rows_affected() == 1)
    }

    async fn restart(
        &self,
        actor: &ActorId,
        pause_minutes: i32,
    ) -> Result<ImportRun, StoreError> {
        let sql = format!(
            r#"INSERT INTO import_runs (actor_id, pause_minutes, status, generation)
               VALUES ($1, $2, 'running', 1)
               ON CONFLICT (actor_id) DO UPDATE SET
                   generation = import_runs.generation + 1,
                   last_success_row = 0,
                   images_downloaded = 0,
                   total_rows = 0,
                   status = 'running',
                   pause_until = NULL,
                   pause_minutes = EXCLUDED.pause_minutes,
                   extra_delay_minutes = 0,
                   error_message = NULL,
                   started_at = NOW(),
                   updated_at = NOW()
               RETURNING {RUN_COLUMNS}"#
        );
        let run = sqlx::query_as::<_, ImportRun>(&sql)
            .bind(actor)
            .bind(pause_minutes)
            .fetch_one(&self.pool)
            .await?;

        Ok(run)
    }

    async fn stop(&self, actor: &ActorId, pause_minutes: i32) -> Result<ImportRun, StoreError> {
        let sql = format!(
            r#"INSERT INTO import_runs (actor_id, pause_minutes, status, generation)
               VALUES ($1, $2, 'stopped', 1)
               ON CONFLICT (actor_id) DO UPDATE SET
                   generation = import_runs.generation + 1,
                   last_success_row = 0,
                   status = 'stopped',
                   pause_until = NULL,
                   updated_at = NOW()
               RETURNING {RUN_COLUMNS}"#
        );
        let run = sqlx::query_as::<_, ImportRun>(&sql)
            .bind(actor)
            .bind(pause_minutes)
            .fetch_one(&self.pool)
            .await?;

        Ok(run)
    }

    async fn fail(
        &self,
        actor: &ActorId,
        generation: i64,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE import_runs
               SET status = 'error', error_message = $3, pause_until = NULL, updated_at = NOW()
               WHERE actor_id = $1 AND generation = $2"#,
        )
        .bind(actor)
        .bind(generation)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

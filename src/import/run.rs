//! Run-level types: the persisted [`ImportRun`] checkpoint, its status machine,
//! and the result/status projections handed back to callers.

use chrono::{DateTime, Utc};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::import::row::ColumnMapping;

/// Identity of whoever initiated a run. One [`ImportRun`] exists per actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "import_run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Waiting,
    Stopped,
    Error,
    Completed,
}

impl RunStatus {
    /// Paused and waiting runs carry a meaningful `pause_until`.
    pub fn is_pausing(self) -> bool {
        matches!(self, RunStatus::Paused | RunStatus::Waiting)
    }
}

/// Durable checkpoint of one actor's import run.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ImportRun {
    pub actor_id: ActorId,
    /// Bumped by every restart and stop; writers holding an older value are fenced off.
    pub generation: i64,
    pub last_success_row: i32,
    /// Attachment fetch attempts so far, accepted or not. Network failures
    /// and rejected responses count too, since this drives the burst cadence.
    pub images_downloaded: i32,
    pub total_rows: i32,
    pub status: RunStatus,
    pub pause_until: Option<DateTime<Utc>>,
    pub pause_minutes: i32,
    pub extra_delay_minutes: i32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportRun {
    /// A fresh idle run, as created on an actor's first request.
    pub fn new(actor_id: ActorId, pause_minutes: i32, now: DateTime<Utc>) -> Self {
        Self {
            actor_id,
            generation: 0,
            last_success_row: 0,
            images_downloaded: 0,
            total_rows: 0,
            status: RunStatus::Idle,
            pause_until: None,
            pause_minutes,
            extra_delay_minutes: 0,
            error_message: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Zero the cursor and counters and mark the run running under a new generation.
    pub fn reset(&mut self, pause_minutes: i32, now: DateTime<Utc>) {
        self.generation += 1;
        self.last_success_row = 0;
        self.images_downloaded = 0;
        self.total_rows = 0;
        self.status = RunStatus::Running;
        self.pause_until = None;
        self.pause_minutes = pause_minutes;
        self.extra_delay_minutes = 0;
        self.error_message = None;
        self.started_at = now;
        self.updated_at = now;
    }

    /// Halt the run and clear its cursor under a new generation.
    pub fn stop(&mut self, now: DateTime<Utc>) {
        self.generation += 1;
        self.last_success_row = 0;
        self.status = RunStatus::Stopped;
        self.pause_until = None;
        self.updated_at = now;
    }

    pub fn status_view(&self) -> StatusView {
        StatusView {
            status: self.status,
            current: self.last_success_row,
            total: self.total_rows,
            error: match self.status {
                RunStatus::Error => self
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "import failed".to_string()),
                _ => String::new(),
            },
        }
    }
}

/// Terminal state of a single importer invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Paused,
    Waiting,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RunResult {
    pub imported: usize,
    pub skipped_duplicates: usize,
    pub last_success_row: i32,
    pub status: RunOutcome,
    pub wait_until: Option<DateTime<Utc>>,
}

/// Read-only projection of a run for the status interface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StatusView {
    pub status: RunStatus,
    pub current: i32,
    pub total: i32,
    pub error: String,
}

impl StatusView {
    /// What an actor without any recorded run sees.
    pub fn idle() -> Self {
        Self {
            status: RunStatus::Idle,
            current: 0,
            total: 0,
            error: String::new(),
        }
    }
}

/// Everything one invocation needs besides the actor: the rows (header first),
/// how to read them, and the category to use when a row names none.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImportRequest {
    pub rows: Vec<Vec<String>>,
    pub mapping: ColumnMapping,
    #[serde(default, rename = "fallbackCategoryId")]
    pub fallback_category_id: Option<i32>,
}

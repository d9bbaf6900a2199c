//! Import control endpoints. Runs execute on the background dispatcher; these
//! handlers only move the checkpoint and the job queue.

use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, get, post};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::import::queue::JobStatusInfo;
use crate::import::{
    ImportJobQueue, ImportRequest, Preview, RunController, RunStatus, StatusView, preview,
};
use crate::routes::Actor;

/// Response returned when an import invocation is queued.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct QueuedImportResponse {
    #[serde(rename = "jobId")]
    pub job_id: i32,
    /// True when an already queued or running job was kept instead of adding one.
    pub reused: bool,
    pub status: StatusView,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StopResponse {
    pub status: StatusView,
    #[serde(rename = "cancelledJobs")]
    pub cancelled_jobs: u64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PreviewRequest {
    pub rows: Vec<Vec<String>>,
}

fn validate(request: &ImportRequest) -> Result<(), ApiError> {
    let header = request
        .rows
        .first()
        .ok_or_else(|| ApiError::BadRequest("rows must start with a header row".to_string()))?;
    request
        .mapping
        .resolve(header)
        .map_err(|e| ApiError::BadRequest(format!("invalid column mapping: {e}")))?;
    Ok(())
}

/// Reset the actor's run and queue an import from the first data row.
#[openapi(tag = "Imports")]
#[post("/imports/start", data = "<request>")]
pub async fn start_import(
    actor: Actor,
    controller: &State<Arc<RunController>>,
    queue: &State<ImportJobQueue>,
    request: Json<ImportRequest>,
) -> Result<Json<QueuedImportResponse>, ApiError> {
    let Actor(actor) = actor;
    validate(&request)?;

    let cancelled = queue.cancel_actor_jobs(&actor).await?;
    if cancelled > 0 {
        log::info!("actor {}: cancelled {} previous jobs", actor, cancelled);
    }

    let run = controller.restart(&actor).await?;
    let job_id = queue.enqueue(&actor, &request).await?;

    Ok(Json(QueuedImportResponse {
        job_id,
        reused: false,
        status: run.status_view(),
    }))
}

/// Queue an import continuing after the actor's last completed row.
#[openapi(tag = "Imports")]
#[post("/imports/resume", data = "<request>")]
pub async fn resume_import(
    actor: Actor,
    controller: &State<Arc<RunController>>,
    queue: &State<ImportJobQueue>,
    request: Json<ImportRequest>,
) -> Result<Json<QueuedImportResponse>, ApiError> {
    let Actor(actor) = actor;
    validate(&request)?;

    let status = controller.status(&actor).await?;
    if status.status == RunStatus::Error {
        return Err(ApiError::Conflict(format!(
            "run for actor '{}' failed and must be restarted",
            actor
        )));
    }

    if let Some(job_id) = queue.active_job(&actor).await? {
        return Ok(Json(QueuedImportResponse {
            job_id,
            reused: true,
            status,
        }));
    }

    let job_id = queue.enqueue(&actor, &request).await?;
    Ok(Json(QueuedImportResponse {
        job_id,
        reused: false,
        status,
    }))
}

/// Halt the actor's run, reset its cursor and cancel pending jobs.
#[openapi(tag = "Imports")]
#[post("/imports/stop")]
pub async fn stop_import(
    actor: Actor,
    controller: &State<Arc<RunController>>,
    queue: &State<ImportJobQueue>,
) -> Result<Json<StopResponse>, ApiError> {
    let Actor(actor) = actor;
    let run = controller.stop(&actor).await?;
    let cancelled_jobs = queue.cancel_actor_jobs(&actor).await?;

    Ok(Json(StopResponse {
        status: run.status_view(),
        cancelled_jobs,
    }))
}

#[openapi(tag = "Imports")]
#[get("/imports/status")]
pub async fn import_status(
    actor: Actor,
    controller: &State<Arc<RunController>>,
) -> Result<Json<StatusView>, ApiError> {
    let Actor(actor) = actor;
    Ok(Json(controller.status(&actor).await?))
}

/// Recent background jobs of the actor, newest first.
#[openapi(tag = "Imports")]
#[get("/imports/jobs")]
pub async fn list_import_jobs(
    actor: Actor,
    queue: &State<ImportJobQueue>,
) -> Result<Json<Vec<JobStatusInfo>>, ApiError> {
    let Actor(actor) = actor;
    Ok(Json(queue.jobs_for_actor(&actor).await?))
}

/// Header and first data rows, for choosing a column mapping.
#[openapi(tag = "Imports")]
#[post("/imports/preview", data = "<request>")]
pub fn preview_rows(request: Json<PreviewRequest>) -> Json<Preview> {
    Json(preview(&request.rows))
}

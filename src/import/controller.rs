//! Run controller: the per-actor entry points (start, resume, restart, stop,
//! status) on top of the row importer.
//!
//! Invocations for the same actor are serialized on an in-process lock.
//! Restart and stop bypass that lock: they bump the run's generation in the
//! checkpoint store and cancel the actor's token. An invocation still
//! holding the lock drops out of any pause at once and otherwise notices at
//! its next row boundary, returning `stopped`.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::import::config::GovernorConfig;
use crate::import::error::{FetchError, ImportError};
use crate::import::governor::RateLimitGovernor;
use crate::import::importer::RowImporter;
use crate::import::run::{ActorId, ImportRequest, ImportRun, RunResult, RunStatus, StatusView};
use crate::import::store::ImportServices;
use crate::models::Category;

#[derive(Default)]
struct ActorSlot {
    lock: Mutex<()>,
    /// Token of the current generation; replaced whenever it is cancelled.
    cancel: parking_lot::Mutex<CancellationToken>,
}

pub struct RunController {
    services: ImportServices,
    importer: RowImporter,
    actors: DashMap<ActorId, Arc<ActorSlot>>,
}

impl RunController {
    pub fn new(
        services: ImportServices,
        governor: GovernorConfig,
        origin_pattern: &str,
    ) -> Result<Self, FetchError> {
        let importer = RowImporter::new(
            services.clone(),
            RateLimitGovernor::new(governor),
            origin_pattern,
        )?;
        Ok(Self {
            services,
            importer,
            actors: DashMap::new(),
        })
    }

    fn pause_minutes(&self) -> i32 {
        self.importer.governor().default_pause_minutes()
    }

    fn slot(&self, actor: &ActorId) -> Arc<ActorSlot> {
        self.actors.entry(actor.clone()).or_default().clone()
    }

    fn cancel_in_flight(&self, actor: &ActorId) {
        let slot = self.slot(actor);
        let mut token = slot.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Restart, then import from the first data row.
    pub async fn start(
        &self,
        actor: &ActorId,
        request: &ImportRequest,
    ) -> Result<RunResult, ImportError> {
        self.restart(actor).await?;
        self.resume(actor, request).await
    }

    /// Continue from the row after the checkpointed cursor.
    pub async fn resume(
        &self,
        actor: &ActorId,
        request: &ImportRequest,
    ) -> Result<RunResult, ImportError> {
        let slot = self.slot(actor);
        let _guard = slot.lock.lock().await;
        let cancel = slot.cancel.lock().clone();

        let run = self
            .services
            .checkpoints
            .get_or_create(actor, self.pause_minutes())
            .await?;
        if run.status == RunStatus::Error {
            return Err(ImportError::RequiresRestart(actor.to_string()));
        }

        let generation = run.generation;
        let start_row = run.last_success_row + 1;

        let outcome = self
            .importer
            .run_cancellable(
                &request.rows,
                &request.mapping,
                request.fallback_category_id,
                actor,
                start_row,
                &cancel,
            )
            .await;

        match outcome {
            Ok(result) => {
                log::info!(
                    "actor {}: invocation ended {:?} at row {}",
                    actor,
                    result.status,
                    result.last_success_row
                );
                Ok(result)
            }
            Err(err) if err.is_fatal() => {
                log::error!("actor {}: import failed: {}", actor, err);
                if let Err(store_err) = self
                    .services
                    .checkpoints
                    .fail(actor, generation, &err.to_string())
                    .await
                {
                    log::error!(
                        "actor {}: failed to record import error: {}",
                        actor,
                        store_err
                    );
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Reset cursor, counters and backoff. Any invocation in flight is fenced off.
    pub async fn restart(&self, actor: &ActorId) -> Result<ImportRun, ImportError> {
        let run = self
            .services
            .checkpoints
            .restart(actor, self.pause_minutes())
            .await?;
        self.cancel_in_flight(actor);
        log::info!(
            "actor {}: run restarted (generation {})",
            actor,
            run.generation
        );
        Ok(run)
    }

    pub async fn stop(&self, actor: &ActorId) -> Result<ImportRun, ImportError> {
        let run = self
            .services
            .checkpoints
            .stop(actor, self.pause_minutes())
            .await?;
        self.cancel_in_flight(actor);
        log::info!("actor {}: run stopped (generation {})", actor, run.generation);
        Ok(run)
    }

    pub async fn status(&self, actor: &ActorId) -> Result<StatusView, ImportError> {
        let run = self.services.checkpoints.find(actor).await?;
        Ok(run.map_or_else(StatusView::idle, |run| run.status_view()))
    }

    pub async fn categories(&self) -> Result<Vec<Category>, ImportError> {
        Ok(self.services.catalog.list_categories().await?)
    }
}

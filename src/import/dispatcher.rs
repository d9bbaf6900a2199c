use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use crate::import::config::DispatcherConfig;
use crate::import::controller::RunController;
use crate::import::error::StoreError;
use crate::import::queue::{ImportJob, ImportJobQueue};
use crate::import::run::RunOutcome;

/// Drains the import job queue in the background. Throttling pauses and the
/// waiting guard hand the job back to the queue with a `run_after`, so no
/// permit is held across them. Burst pauses are short in-task sleeps that a
/// stop or restart cuts short.
pub struct ImportDispatcher {
    queue: ImportJobQueue,
    controller: Arc<RunController>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
}

impl ImportDispatcher {
    pub fn new(
        queue: ImportJobQueue,
        controller: Arc<RunController>,
        config: DispatcherConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            queue,
            controller,
            config,
            permits,
        }
    }

    /// Claim one due job and process it inline. Returns the job id, or `None`
    /// when nothing was due.
    pub async fn process_next(&self) -> Result<Option<i32>, StoreError> {
        let Some(job) = self.queue.get_next_job().await? else {
            return Ok(None);
        };
        let job_id = job.id;
        process_job(&self.queue, &self.controller, &self.config, job).await;
        Ok(Some(job_id))
    }

    async fn sweep_stale_jobs(&self) {
        match self.queue.requeue_stale_jobs().await {
            Ok(0) => {}
            Ok(count) => log::warn!("dispatcher: requeued {} stale jobs", count),
            Err(e) => log::error!("dispatcher: failed to requeue stale jobs: {}", e),
        }
    }

    /// Run dispatcher loop forever
    pub async fn run(self) -> ! {
        log::info!(
            "import dispatcher started (concurrency {})",
            self.config.concurrency
        );

        let mut last_sweep = Instant::now();
        loop {
            if last_sweep.elapsed() >= self.config.stale_after {
                self.sweep_stale_jobs().await;
                last_sweep = Instant::now();
            }

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    log::error!("dispatcher: semaphore unavailable: {}", e);
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            let job = match self.queue.get_next_job().await {
                Ok(Some(job)) => {
                    log::info!(
                        "dispatcher: claimed job {} for actor {} (attempt {})",
                        job.id,
                        job.actor_id,
                        job.attempts
                    );
                    job
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    log::error!("dispatcher: failed to get job: {}", e);
                    drop(permit);
                    tokio::time::sleep(self.config.poll_interval * 2).await;
                    continue;
                }
            };

            let queue = self.queue.clone();
            let controller = Arc::clone(&self.controller);
            let config = self.config.clone();
            tokio::spawn(async move {
                process_job(&queue, &controller, &config, job).await;
                drop(permit);
            });
        }
    }
}

async fn process_job(
    queue: &ImportJobQueue,
    controller: &RunController,
    config: &DispatcherConfig,
    job: ImportJob,
) {
    let job_id = job.id;

    let request = match job.request() {
        Ok(request) => request,
        Err(e) => {
            log::error!("job {}: unreadable payload: {}", job_id, e);
            if let Err(e) = queue.fail_job(job_id, e.to_string()).await {
                log::error!("job {}: failed to mark failed: {}", job_id, e);
            }
            return;
        }
    };

    let work = controller.resume(&job.actor_id, &request);
    tokio::pin!(work);
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await;

    let outcome = loop {
        tokio::select! {
            outcome = &mut work => break outcome,
            _ = heartbeat.tick() => {
                if let Err(e) = queue.heartbeat(job_id).await {
                    log::warn!("job {}: failed to record heartbeat: {}", job_id, e);
                }
            }
        }
    };

    let update = match outcome {
        Ok(result) => match result.status {
            RunOutcome::Completed => {
                log::info!(
                    "job {}: completed, {} imported, {} duplicates",
                    job_id,
                    result.imported,
                    result.skipped_duplicates
                );
                queue.complete_job(job_id).await
            }
            RunOutcome::Paused | RunOutcome::Waiting => {
                let run_after = result.wait_until.unwrap_or_else(chrono::Utc::now);
                log::info!("job {}: {:?}, rescheduled for {}", job_id, result.status, run_after);
                queue.reschedule(job_id, run_after).await
            }
            RunOutcome::Stopped => {
                log::info!("job {}: run stopped, cancelling", job_id);
                queue.cancel_job(job_id).await
            }
        },
        Err(e) => {
            log::error!("job {}: import failed: {}", job_id, e);
            queue.fail_job(job_id, e.to_string()).await
        }
    };

    if let Err(e) = update {
        log::error!("job {}: failed to update job state: {}", job_id, e);
    }
}

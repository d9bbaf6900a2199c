use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use import_server::import::config::DEFAULT_ATTACHMENT_ORIGIN;
use import_server::import::queue::JobStatusInfo;
use import_server::import::{
    ActorId, AttachmentSource, CheckpointStore, ColumnMapping, DispatcherConfig, FetchError,
    FetchedAttachment, ImportDispatcher, ImportJobQueue, ImportRequest, ImportServices, JobStatus,
    RunController,
};
use import_server::test_support::{
    MemoryCheckpointStore, MemoryServices, TestDatabase, TestDatabaseError, governor_config,
};
use rocket_db_pools::sqlx::{self, PgPool};

async fn database() -> Option<TestDatabase> {
    match TestDatabase::new_from_env().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping postgres queue test: no test database configured");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

fn image_url(tag: &str) -> String {
    format!("https://00.img.avito.st/image/1/{tag}.jpg")
}

/// Two data rows whose external ids start with `prefix`.
fn request(prefix: &str, photos: &str) -> ImportRequest {
    ImportRequest {
        rows: vec![
            vec!["Name".into(), "SKU".into(), "Photos".into(), "Category".into()],
            vec!["Lamp".into(), format!("{prefix}-1"), photos.into(), "Home".into()],
            vec!["Desk".into(), format!("{prefix}-2"), String::new(), "Home".into()],
        ],
        mapping: ColumnMapping {
            name: Some("Name".into()),
            external_id: Some("SKU".into()),
            attachment_refs: Some("Photos".into()),
            category_label: Some("Category".into()),
            ..ColumnMapping::default()
        },
        fallback_category_id: None,
    }
}

fn dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval: Duration::from_millis(50),
        concurrency: 1,
        heartbeat_interval: Duration::from_secs(1),
        stale_after: Duration::from_secs(60),
    }
}

fn controller(services: ImportServices) -> Arc<RunController> {
    Arc::new(
        RunController::new(services, governor_config(), DEFAULT_ATTACHMENT_ORIGIN)
            .expect("valid origin pattern"),
    )
}

async fn job(queue: &ImportJobQueue, actor: &ActorId, id: i32) -> JobStatusInfo {
    queue
        .jobs_for_actor(actor)
        .await
        .expect("list jobs")
        .into_iter()
        .find(|job| job.id == id)
        .expect("job exists")
}

async fn age_heartbeat(pool: &PgPool, id: i32) {
    sqlx::query("UPDATE import_jobs SET last_heartbeat = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .expect("age heartbeat");
}

async fn make_due(pool: &PgPool, id: i32) {
    sqlx::query("UPDATE import_jobs SET run_after = NOW() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .expect("make job due");
}

fn assert_same_instant(left: DateTime<Utc>, right: DateTime<Utc>) {
    assert!(
        (left - right).num_milliseconds().abs() <= 1,
        "{left} != {right}"
    );
}

#[tokio::test]
async fn jobs_are_claimed_when_due_and_settle_once() {
    let Some(test_db) = database().await else {
        return;
    };
    let queue = ImportJobQueue::new(test_db.pool_clone());
    let actor = ActorId::new("queue-actor");

    let later = queue
        .enqueue(&actor, &request("q", ""))
        .await
        .expect("enqueue");
    let claimed = queue.get_next_job().await.expect("claim").expect("due job");
    assert_eq!((claimed.id, claimed.attempts), (later, 1));
    assert_eq!(claimed.actor_id, actor);
    assert_eq!(claimed.request().expect("payload").rows.len(), 3);
    assert!(queue.get_next_job().await.expect("claim").is_none());

    let run_after = Utc::now() + chrono::Duration::hours(1);
    queue.reschedule(later, run_after).await.expect("reschedule");
    let info = job(&queue, &actor, later).await;
    assert_eq!(info.status, JobStatus::Queued);
    assert_same_instant(info.run_after, run_after);
    assert!(queue.get_next_job().await.expect("claim").is_none());
    assert_eq!(queue.active_job(&actor).await.expect("active"), Some(later));

    let done = queue.enqueue(&actor, &request("q", "")).await.expect("enqueue");
    assert_eq!(queue.get_next_job().await.expect("claim").map(|j| j.id), Some(done));
    queue.complete_job(done).await.expect("complete");
    queue.cancel_job(done).await.expect("cancel is a no-op");
    assert_eq!(job(&queue, &actor, done).await.status, JobStatus::Succeeded);

    let failed = queue.enqueue(&actor, &request("q", "")).await.expect("enqueue");
    assert_eq!(queue.get_next_job().await.expect("claim").map(|j| j.id), Some(failed));
    queue.fail_job(failed, "boom".into()).await.expect("fail");
    let info = job(&queue, &actor, failed).await;
    assert_eq!(info.status, JobStatus::Failed);
    assert_eq!(info.error_message.as_deref(), Some("boom"));

    assert_eq!(queue.cancel_actor_jobs(&actor).await.expect("cancel"), 1);
    assert_eq!(job(&queue, &actor, later).await.status, JobStatus::Cancelled);
    assert_eq!(queue.active_job(&actor).await.expect("active"), None);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn jobs_left_running_by_a_dead_process_are_reclaimed() {
    let Some(test_db) = database().await else {
        return;
    };
    let actor = ActorId::new("crashed");

    let before_crash = ImportJobQueue::new(test_db.pool_clone());
    let id = before_crash
        .enqueue(&actor, &request("c", ""))
        .await
        .expect("enqueue");
    before_crash.get_next_job().await.expect("claim").expect("due job");
    drop(before_crash);

    let after_restart = ImportJobQueue::new(test_db.pool_clone());
    assert!(after_restart.get_next_job().await.expect("claim").is_none());
    assert_eq!(after_restart.requeue_stale_jobs().await.expect("sweep"), 0);

    assert_eq!(after_restart.requeue_running_jobs().await.expect("requeue"), 1);
    let reclaimed = after_restart
        .get_next_job()
        .await
        .expect("claim")
        .expect("requeued job");
    assert_eq!((reclaimed.id, reclaimed.attempts), (id, 2));

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn stale_running_jobs_stop_counting_as_active() {
    let Some(test_db) = database().await else {
        return;
    };
    let pool = test_db.pool_clone();
    let queue = ImportJobQueue::new(pool.clone()).with_stale_after(Duration::from_secs(120));
    let actor = ActorId::new("stale");

    let id = queue.enqueue(&actor, &request("s", "")).await.expect("enqueue");
    queue.get_next_job().await.expect("claim").expect("due job");
    assert_eq!(queue.active_job(&actor).await.expect("active"), Some(id));

    age_heartbeat(&pool, id).await;
    assert_eq!(queue.active_job(&actor).await.expect("active"), None);

    queue.heartbeat(id).await.expect("heartbeat");
    assert_eq!(queue.active_job(&actor).await.expect("active"), Some(id));

    age_heartbeat(&pool, id).await;
    assert_eq!(queue.requeue_stale_jobs().await.expect("sweep"), 1);
    assert_eq!(job(&queue, &actor, id).await.status, JobStatus::Queued);
    assert_eq!(queue.active_job(&actor).await.expect("active"), Some(id));

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn dispatcher_maps_run_outcomes_to_job_states() {
    let Some(test_db) = database().await else {
        return;
    };
    let pool = test_db.pool_clone();
    let queue = ImportJobQueue::new(pool.clone());
    let mem = MemoryServices::new();
    let dispatcher = ImportDispatcher::new(
        queue.clone(),
        controller(mem.services()),
        dispatcher_config(),
    );

    assert_eq!(dispatcher.process_next().await.expect("idle poll"), None);

    let done = ActorId::new("done");
    let id = queue.enqueue(&done, &request("d", "")).await.expect("enqueue");
    assert_eq!(dispatcher.process_next().await.expect("process"), Some(id));
    assert_eq!(job(&queue, &done, id).await.status, JobStatus::Succeeded);
    assert!(mem.catalog.product("d-2").is_some());

    let slow = ActorId::new("slow");
    mem.source.throttle(&image_url("slow"));
    let id = queue
        .enqueue(&slow, &request("p", &image_url("slow")))
        .await
        .expect("enqueue");
    assert_eq!(dispatcher.process_next().await.expect("process"), Some(id));
    let pause_until = mem
        .checkpoints
        .run(&slow)
        .and_then(|run| run.pause_until)
        .expect("run paused");
    let info = job(&queue, &slow, id).await;
    assert_eq!(info.status, JobStatus::Queued);
    assert_same_instant(info.run_after, pause_until);

    // Claimed early, the run is still waiting and goes back to the queue.
    make_due(&pool, id).await;
    assert_eq!(dispatcher.process_next().await.expect("process"), Some(id));
    let info = job(&queue, &slow, id).await;
    assert_eq!((info.status, info.attempts), (JobStatus::Queued, 2));
    assert_same_instant(info.run_after, pause_until);
    assert_eq!(mem.source.requests().len(), 1);

    let broken = ActorId::new("broken");
    mem.catalog.set_fail_writes(true);
    let id = queue.enqueue(&broken, &request("b", "")).await.expect("enqueue");
    assert_eq!(dispatcher.process_next().await.expect("process"), Some(id));
    mem.catalog.set_fail_writes(false);
    let info = job(&queue, &broken, id).await;
    assert_eq!(info.status, JobStatus::Failed);
    assert!(
        info.error_message
            .is_some_and(|message| message.starts_with("database error"))
    );

    test_db.close().await.expect("failed to drop test database");
}

/// Origin that stops the actor's run as a side effect of every fetch.
struct StopOnFetch {
    checkpoints: Arc<MemoryCheckpointStore>,
    actor: ActorId,
}

#[async_trait]
impl AttachmentSource for StopOnFetch {
    async fn fetch(&self, url: &str) -> Result<FetchedAttachment, FetchError> {
        self.checkpoints
            .stop(&self.actor, 5)
            .await
            .expect("stop succeeds");
        Ok(FetchedAttachment {
            status: 200,
            final_url: url.to_string(),
            body: b"jpeg".to_vec(),
        })
    }
}

#[tokio::test]
async fn stopped_runs_cancel_their_job() {
    let Some(test_db) = database().await else {
        return;
    };
    let queue = ImportJobQueue::new(test_db.pool_clone());
    let mem = MemoryServices::new();
    let actor = ActorId::new("stopper");
    let services = ImportServices {
        source: Arc::new(StopOnFetch {
            checkpoints: mem.checkpoints.clone(),
            actor: actor.clone(),
        }),
        ..mem.services()
    };
    let dispatcher = ImportDispatcher::new(queue.clone(), controller(services), dispatcher_config());

    let id = queue
        .enqueue(&actor, &request("x", &image_url("x")))
        .await
        .expect("enqueue");
    assert_eq!(dispatcher.process_next().await.expect("process"), Some(id));
    assert_eq!(job(&queue, &actor, id).await.status, JobStatus::Cancelled);

    test_db.close().await.expect("failed to drop test database");
}

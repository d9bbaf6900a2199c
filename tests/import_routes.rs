use std::sync::Arc;

use import_server::import::config::DEFAULT_ATTACHMENT_ORIGIN;
use import_server::import::queue::JobStatusInfo;
use import_server::import::{
    ActorId, ColumnMapping, ImportJobQueue, ImportRequest, JobStatus, Preview, RunController,
    RunStatus, StatusView,
};
use import_server::models::Category;
use import_server::routes::categories::list_categories;
use import_server::routes::imports::{
    QueuedImportResponse, StopResponse, import_status, list_import_jobs, preview_rows,
    resume_import, start_import, stop_import,
};
use import_server::test_support::{
    MemoryServices, TestDatabase, TestDatabaseError, TestRocketBuilder, governor_config,
};
use rocket::http::{ContentType, Header, Status};
use rocket::local::asynchronous::Client;
use rocket::routes;
use rocket_db_pools::sqlx;
use serde_json::json;

fn controller(mem: &MemoryServices) -> Arc<RunController> {
    Arc::new(
        RunController::new(mem.services(), governor_config(), DEFAULT_ATTACHMENT_ORIGIN)
            .expect("valid origin pattern"),
    )
}

#[tokio::test]
async fn status_reflects_the_actors_run() {
    let mem = MemoryServices::new();
    let controller = controller(&mem);
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![import_status])
        .manage(controller.clone())
        .async_client()
        .await;

    let response = client
        .get("/api/v1/imports/status")
        .header(Header::new("X-Import-Actor", "7"))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let idle: StatusView = response.into_json().await.expect("valid JSON payload");
    assert_eq!(idle, StatusView::idle());

    let request = ImportRequest {
        rows: vec![
            vec!["Title".into(), "Id".into()],
            vec!["Lamp".into(), "L-1".into()],
            vec!["Desk".into(), "D-1".into()],
        ],
        mapping: ColumnMapping {
            name: Some("Title".into()),
            external_id: Some("Id".into()),
            ..ColumnMapping::default()
        },
        fallback_category_id: Some(mem.catalog.seed_category("Furniture").id),
    };
    controller
        .start(&ActorId::new("7"), &request)
        .await
        .expect("import runs");

    let view: StatusView = client
        .get("/api/v1/imports/status")
        .header(Header::new("X-Import-Actor", "7"))
        .dispatch()
        .await
        .into_json()
        .await
        .expect("valid JSON payload");
    assert_eq!(view.status, RunStatus::Completed);
    assert_eq!((view.current, view.total), (2, 2));

    let other: StatusView = client
        .get("/api/v1/imports/status")
        .header(Header::new("X-Import-Actor", "8"))
        .dispatch()
        .await
        .into_json()
        .await
        .expect("valid JSON payload");
    assert_eq!(other.status, RunStatus::Idle);
}

#[test]
fn status_requires_an_actor_header() {
    let mem = MemoryServices::new();
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![import_status])
        .manage(controller(&mem))
        .blocking_client();

    let response = client.get("/api/v1/imports/status").dispatch();
    assert_eq!(response.status(), Status::BadRequest);
}

#[test]
fn preview_returns_header_and_first_five_rows() {
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![preview_rows])
        .blocking_client();

    let rows: Vec<Vec<String>> = std::iter::once(vec!["Name".to_string(), "SKU".to_string()])
        .chain((1..=8).map(|i| vec![format!("Item {i}"), format!("s{i}")]))
        .collect();

    let response = client
        .post("/api/v1/imports/preview")
        .header(ContentType::JSON)
        .body(json!({ "rows": rows }).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let preview: Preview = response.into_json().expect("valid JSON payload");
    assert_eq!(preview.columns, vec!["Name", "SKU"]);
    assert_eq!(preview.rows.len(), 5);
    assert_eq!(preview.rows[0], vec!["Item 1", "s1"]);
}

#[test]
fn categories_are_listed_by_name() {
    let mem = MemoryServices::new();
    mem.catalog.seed_category("Tablets");
    mem.catalog.seed_category("Laptops");
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![list_categories])
        .manage(controller(&mem))
        .blocking_client();

    let response = client.get("/api/v1/categories").dispatch();
    assert_eq!(response.status(), Status::Ok);

    let categories: Vec<Category> = response.into_json().expect("valid JSON payload");
    let names: Vec<&str> = categories.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["Laptops", "Tablets"]);
}

async fn database() -> Option<TestDatabase> {
    match TestDatabase::new_from_env().await {
        Ok(db) => Some(db),
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping queued route test: no test database configured");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

fn furniture_request() -> ImportRequest {
    ImportRequest {
        rows: vec![
            vec!["Title".into(), "Id".into(), "Kind".into()],
            vec!["Lamp".into(), "L-1".into(), "Furniture".into()],
        ],
        mapping: ColumnMapping {
            name: Some("Title".into()),
            external_id: Some("Id".into()),
            category_label: Some("Kind".into()),
            ..ColumnMapping::default()
        },
        fallback_category_id: None,
    }
}

async fn post_as(
    client: &Client,
    uri: &str,
    actor: &str,
    body: Option<&ImportRequest>,
) -> (Status, String) {
    let mut request = client
        .post(uri)
        .header(Header::new("X-Import-Actor", actor.to_string()));
    if let Some(body) = body {
        request = request
            .header(ContentType::JSON)
            .body(serde_json::to_string(body).expect("serializable request"));
    }
    let response = request.dispatch().await;
    let status = response.status();
    (status, response.into_string().await.unwrap_or_default())
}

#[tokio::test]
async fn start_resume_and_stop_drive_the_job_queue() {
    let Some(test_db) = database().await else {
        return;
    };
    let pool = test_db.pool_clone();
    let queue = ImportJobQueue::new(pool.clone());
    let mem = MemoryServices::new();
    let controller = controller(&mem);
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![
            start_import,
            resume_import,
            stop_import,
            list_import_jobs
        ])
        .manage(controller.clone())
        .manage(queue.clone())
        .async_client()
        .await;
    let request = furniture_request();

    let (status, body) = post_as(&client, "/api/v1/imports/start", "9", Some(&request)).await;
    assert_eq!(status, Status::Ok);
    let started: QueuedImportResponse = serde_json::from_str(&body).expect("valid JSON payload");
    assert!(!started.reused);

    let (status, body) = post_as(&client, "/api/v1/imports/resume", "9", Some(&request)).await;
    assert_eq!(status, Status::Ok);
    let resumed: QueuedImportResponse = serde_json::from_str(&body).expect("valid JSON payload");
    assert!(resumed.reused);
    assert_eq!(resumed.job_id, started.job_id);

    let jobs: Vec<JobStatusInfo> = client
        .get("/api/v1/imports/jobs")
        .header(Header::new("X-Import-Actor", "9"))
        .dispatch()
        .await
        .into_json()
        .await
        .expect("valid JSON payload");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Queued);

    let (status, body) = post_as(&client, "/api/v1/imports/stop", "9", None).await;
    assert_eq!(status, Status::Ok);
    let stopped: StopResponse = serde_json::from_str(&body).expect("valid JSON payload");
    assert_eq!(stopped.cancelled_jobs, 1);
    assert_eq!(stopped.status.status, RunStatus::Stopped);
    assert_eq!(queue.active_job(&ActorId::new("9")).await.expect("active"), None);

    // A job whose worker died is not reused.
    let (_, body) = post_as(&client, "/api/v1/imports/resume", "9", Some(&request)).await;
    let queued: QueuedImportResponse = serde_json::from_str(&body).expect("valid JSON payload");
    assert!(!queued.reused);
    let claimed = queue.get_next_job().await.expect("claim").expect("due job");
    assert_eq!(claimed.id, queued.job_id);
    sqlx::query("UPDATE import_jobs SET last_heartbeat = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(claimed.id)
        .execute(&pool)
        .await
        .expect("age heartbeat");

    let (_, body) = post_as(&client, "/api/v1/imports/resume", "9", Some(&request)).await;
    let replacement: QueuedImportResponse =
        serde_json::from_str(&body).expect("valid JSON payload");
    assert!(!replacement.reused);
    assert_ne!(replacement.job_id, claimed.id);

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn resume_of_a_failed_run_conflicts() {
    let Some(test_db) = database().await else {
        return;
    };
    let queue = ImportJobQueue::new(test_db.pool_clone());
    let mem = MemoryServices::new();
    let controller = controller(&mem);
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![start_import, resume_import])
        .manage(controller.clone())
        .manage(queue.clone())
        .async_client()
        .await;
    let request = furniture_request();

    mem.catalog.set_fail_writes(true);
    controller
        .start(&ActorId::new("4"), &request)
        .await
        .expect_err("store failure");
    mem.catalog.set_fail_writes(false);

    let (status, _) = post_as(&client, "/api/v1/imports/resume", "4", Some(&request)).await;
    assert_eq!(status, Status::Conflict);
    assert_eq!(queue.active_job(&ActorId::new("4")).await.expect("active"), None);

    let (status, _) = post_as(&client, "/api/v1/imports/start", "4", Some(&request)).await;
    assert_eq!(status, Status::Ok);
    assert!(queue.active_job(&ActorId::new("4")).await.expect("active").is_some());

    test_db.close().await.expect("failed to drop test database");
}

#[macro_use]
extern crate rocket;

pub mod db;
pub mod error;
pub mod import;
pub mod models;
pub mod request_logger;
pub mod routes;

use crate::db::ImportDb;
use crate::import::{
    DispatcherConfig, FetchConfig, GovernorConfig, HttpAttachmentSource, ImportDispatcher,
    ImportJobQueue, ImportServices, PgCatalogStore, PgCheckpointStore, RunController, TokioClock,
};
use crate::request_logger::RequestLogger;
use env_logger::{Env, Target};
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_db_pools::sqlx::PgPool;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::fs::OpenOptions;
use std::sync::{Arc, Once};

static LOGGER: Once = Once::new();

const DEFAULT_LOG_FILTER: &str = "info,rocket::server=warn,rocket::request=warn";

/// Initialise `env_logger` once. With `IMPORT_LOG_FILE` set, output is
/// appended to that file instead of stderr.
pub fn init_logger() {
    LOGGER.call_once(|| {
        let mut builder =
            env_logger::Builder::from_env(Env::default().default_filter_or(DEFAULT_LOG_FILTER));

        if let Ok(path) = std::env::var("IMPORT_LOG_FILE") {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    builder.target(Target::Pipe(Box::new(file)));
                }
                Err(e) => eprintln!("failed to open log file {}: {}", path, e),
            }
        }

        builder.init();
    });
}

/// Wire the Postgres stores, the HTTP attachment origin and the real clock
/// into one run controller.
pub fn build_controller(pool: PgPool) -> Result<RunController, import::FetchError> {
    let fetch_config = FetchConfig::from_env();
    let services = ImportServices {
        checkpoints: Arc::new(PgCheckpointStore::new(pool.clone())),
        catalog: Arc::new(PgCatalogStore::new(pool)),
        source: Arc::new(HttpAttachmentSource::new(&fetch_config)?),
        clock: Arc::new(TokioClock),
    };

    RunController::new(
        services,
        GovernorConfig::from_env(),
        &fetch_config.origin_pattern,
    )
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    rocket::build()
        .attach(RequestLogger)
        .attach(ImportDb::init())
        .attach(cors)
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match ImportDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        match import::run_migrations(&pool).await {
                            Ok(_) => {
                                log::info!("database migrations successful");
                                Ok(rocket)
                            }
                            Err(e) => {
                                log::error!("database migrations failed: {}", e);
                                Err(rocket)
                            }
                        }
                    }
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        .attach(AdHoc::try_on_ignite(
            "Import Engine",
            |rocket| async move {
                let Some(db) = ImportDb::fetch(&rocket) else {
                    log::error!("database pool not available for import engine");
                    return Err(rocket);
                };
                let pool = (**db).clone();

                let controller = match build_controller(pool.clone()) {
                    Ok(controller) => controller,
                    Err(e) => {
                        log::error!("failed to initialize import engine: {}", e);
                        return Err(rocket);
                    }
                };

                let config = DispatcherConfig::from_env();
                let queue = ImportJobQueue::new(pool.clone()).with_stale_after(config.stale_after);
                // No dispatcher runs yet, so every running job was orphaned by
                // the previous process.
                match queue.requeue_running_jobs().await {
                    Ok(0) => {}
                    Ok(count) => log::info!("requeued {} interrupted import jobs", count),
                    Err(e) => {
                        log::error!("failed to requeue interrupted import jobs: {}", e);
                        return Err(rocket);
                    }
                }

                Ok(rocket
                    .manage(queue)
                    .manage(config)
                    .manage(Arc::new(controller))
                    .manage(pool))
            },
        ))
        // Spawn import dispatcher in background
        .attach(AdHoc::on_liftoff("Spawn Import Dispatcher", |rocket| {
            Box::pin(async move {
                let queue = rocket.state::<ImportJobQueue>().cloned();
                let controller = rocket.state::<Arc<RunController>>().cloned();
                let config = rocket.state::<DispatcherConfig>().cloned();
                match (queue, controller, config) {
                    (Some(queue), Some(controller), Some(config)) => {
                        let dispatcher = ImportDispatcher::new(queue, controller, config);
                        tokio::spawn(async move { dispatcher.run().await });
                    }
                    _ => log::error!("failed to spawn import dispatcher: engine state not found"),
                }
            })
        }))
        .mount(
            "/api/v1",
            openapi_get_routes![
                routes::health::health_check,
                routes::categories::list_categories,
                routes::imports::start_import,
                routes::imports::resume_import,
                routes::imports::stop_import,
                routes::imports::import_status,
                routes::imports::list_import_jobs,
                routes::imports::preview_rows,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Import API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};

    pub use database::{TestDatabase, TestDatabaseError};
    pub use memory::{
        ManualClock, MemoryCatalog, MemoryCheckpointStore, MemoryServices, ScriptedSource,
        governor_config,
    };

    pub mod memory {
        //! In-process doubles for the import engine's collaborators.

        use async_trait::async_trait;
        use chrono::{DateTime, Utc};
        use parking_lot::Mutex;
        use std::collections::{HashMap, VecDeque};
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        use crate::import::{
            ActorId, AttachmentSource, CatalogStore, CheckpointStore, Clock, FetchError,
            FetchedAttachment, GovernorConfig, ImportRun, ImportServices, RunStatus, StoreError,
        };
        use crate::models::{Category, NewProduct, NewProductImage, Product, ProductImage};

        /// Governor settings independent of the environment.
        pub fn governor_config() -> GovernorConfig {
            GovernorConfig {
                pause_minutes: 5,
                throttle_increment_minutes: 3,
                burst_every: 10,
                delay_min: Duration::from_secs(3),
                delay_max: Duration::from_secs(7),
            }
        }

        /// Checkpoint store that also records every accepted save.
        #[derive(Default)]
        pub struct MemoryCheckpointStore {
            runs: Mutex<HashMap<ActorId, ImportRun>>,
            history: Mutex<Vec<ImportRun>>,
        }

        impl MemoryCheckpointStore {
            pub fn run(&self, actor: &ActorId) -> Option<ImportRun> {
                self.runs.lock().get(actor).cloned()
            }

            pub fn insert(&self, run: ImportRun) {
                self.runs.lock().insert(run.actor_id.clone(), run);
            }

            /// Every run state accepted by `save`, oldest first.
            pub fn history(&self) -> Vec<ImportRun> {
                self.history.lock().clone()
            }
        }

        #[async_trait]
        impl CheckpointStore for MemoryCheckpointStore {
            async fn find(&self, actor: &ActorId) -> Result<Option<ImportRun>, StoreError> {
                Ok(self.run(actor))
            }

            async fn get_or_create(
                &self,
                actor: &ActorId,
                pause_minutes: i32,
            ) -> Result<ImportRun, StoreError> {
                let mut runs = self.runs.lock();
                let run = runs
                    .entry(actor.clone())
                    .or_insert_with(|| ImportRun::new(actor.clone(), pause_minutes, Utc::now()));
                Ok(run.clone())
            }

            async fn save(&self, run: &ImportRun) -> Result<bool, StoreError> {
                let mut runs = self.runs.lock();
                match runs.get_mut(&run.actor_id) {
                    Some(current) if current.generation == run.generation => {
                        *current = run.clone();
                        self.history.lock().push(run.clone());
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }

            async fn restart(
                &self,
                actor: &ActorId,
                pause_minutes: i32,
            ) -> Result<ImportRun, StoreError> {
                let now = Utc::now();
                let mut runs = self.runs.lock();
                let run = runs
                    .entry(actor.clone())
                    .or_insert_with(|| ImportRun::new(actor.clone(), pause_minutes, now));
                run.reset(pause_minutes, now);
                Ok(run.clone())
            }

            async fn stop(
                &self,
                actor: &ActorId,
                pause_minutes: i32,
            ) -> Result<ImportRun, StoreError> {
                let now = Utc::now();
                let mut runs = self.runs.lock();
                let run = runs
                    .entry(actor.clone())
                    .or_insert_with(|| ImportRun::new(actor.clone(), pause_minutes, now));
                run.stop(now);
                Ok(run.clone())
            }

            async fn fail(
                &self,
                actor: &ActorId,
                generation: i64,
                message: &str,
            ) -> Result<(), StoreError> {
                if let Some(run) = self.runs.lock().get_mut(actor) {
                    if run.generation == generation {
                        run.status = RunStatus::Error;
                        run.error_message = Some(message.to_string());
                        run.pause_until = None;
                    }
                }
                Ok(())
            }
        }

        #[derive(Default)]
        struct CatalogState {
            categories: Vec<Category>,
            products: Vec<Product>,
            images: Vec<ProductImage>,
        }

        /// Catalog store over vectors. Product writes can be made to fail.
        #[derive(Default)]
        pub struct MemoryCatalog {
            state: Mutex<CatalogState>,
            fail_writes: AtomicBool,
        }

        impl MemoryCatalog {
            pub fn seed_category(&self, name: &str) -> Category {
                let mut state = self.state.lock();
                let category = Category {
                    id: state.categories.len() as i32 + 1,
                    name: name.to_string(),
                    created_at: Utc::now(),
                };
                state.categories.push(category.clone());
                category
            }

            /// Make product inserts fail with a database error.
            pub fn set_fail_writes(&self, fail: bool) {
                self.fail_writes.store(fail, Ordering::SeqCst);
            }

            pub fn categories(&self) -> Vec<Category> {
                self.state.lock().categories.clone()
            }

            pub fn products(&self) -> Vec<Product> {
                self.state.lock().products.clone()
            }

            pub fn product(&self, external_id: &str) -> Option<Product> {
                self.state
                    .lock()
                    .products
                    .iter()
                    .find(|p| p.external_id == external_id)
                    .cloned()
            }

            pub fn images_for(&self, product_id: i32) -> Vec<ProductImage> {
                self.state
                    .lock()
                    .images
                    .iter()
                    .filter(|image| image.product_id == product_id)
                    .cloned()
                    .collect()
            }
        }

        #[async_trait]
        impl CatalogStore for MemoryCatalog {
            async fn get_or_create_category(&self, name: &str) -> Result<Category, StoreError> {
                if let Some(existing) = self
                    .state
                    .lock()
                    .categories
                    .iter()
                    .find(|c| c.name == name)
                {
                    return Ok(existing.clone());
                }
                Ok(self.seed_category(name))
            }

            async fn find_category(&self, id: i32) -> Result<Option<Category>, StoreError> {
                Ok(self
                    .state
                    .lock()
                    .categories
                    .iter()
                    .find(|c| c.id == id)
                    .cloned())
            }

            async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
                let mut categories = self.categories();
                categories.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(categories)
            }

            async fn product_exists(&self, external_id: &str) -> Result<bool, StoreError> {
                Ok(self.product(external_id).is_some())
            }

            async fn create_product(
                &self,
                product: &NewProduct,
            ) -> Result<Option<Product>, StoreError> {
                if self.fail_writes.load(Ordering::SeqCst) {
                    return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
                }

                let mut state = self.state.lock();
                if state
                    .products
                    .iter()
                    .any(|p| p.external_id == product.external_id)
                {
                    return Ok(None);
                }

                let created = Product {
                    id: state.products.len() as i32 + 1,
                    category_id: product.category_id,
                    name: product.name.clone(),
                    slug: product.slug.clone(),
                    price_cents: product.price_cents,
                    description: product.description.clone(),
                    external_id: product.external_id.clone(),
                    available: true,
                    created_at: Utc::now(),
                };
                state.products.push(created.clone());
                Ok(Some(created))
            }

            async fn add_image(&self, image: &NewProductImage) -> Result<ProductImage, StoreError> {
                let mut state = self.state.lock();
                let stored = ProductImage {
                    id: state.images.len() as i32 + 1,
                    product_id: image.product_id,
                    position: image.position,
                    is_primary: image.is_primary,
                    file_name: image.file_name.clone(),
                    source_url: image.source_url.clone(),
                    created_at: Utc::now(),
                };
                state.images.push(stored.clone());
                Ok(stored)
            }
        }

        /// Attachment origin answering from per-URL response queues. URLs
        /// without a queued response answer 404.
        #[derive(Default)]
        pub struct ScriptedSource {
            responses: Mutex<HashMap<String, VecDeque<FetchedAttachment>>>,
            requests: Mutex<Vec<String>>,
        }

        impl ScriptedSource {
            pub fn respond(&self, url: &str, status: u16, final_url: &str) {
                let body = if status == 200 {
                    b"\xff\xd8\xff\xe0jpeg".to_vec()
                } else {
                    Vec::new()
                };
                self.responses
                    .lock()
                    .entry(url.to_string())
                    .or_default()
                    .push_back(FetchedAttachment {
                        status,
                        final_url: final_url.to_string(),
                        body,
                    });
            }

            /// Queue a 200 response served from the URL itself.
            pub fn image(&self, url: &str) {
                self.respond(url, 200, url);
            }

            pub fn throttle(&self, url: &str) {
                self.respond(url, 429, url);
            }

            /// URLs fetched so far, in order.
            pub fn requests(&self) -> Vec<String> {
                self.requests.lock().clone()
            }
        }

        #[async_trait]
        impl AttachmentSource for ScriptedSource {
            async fn fetch(&self, url: &str) -> Result<FetchedAttachment, FetchError> {
                self.requests.lock().push(url.to_string());
                let scripted = self
                    .responses
                    .lock()
                    .get_mut(url)
                    .and_then(|queue| queue.pop_front());

                Ok(scripted.unwrap_or_else(|| FetchedAttachment {
                    status: 404,
                    final_url: url.to_string(),
                    body: Vec::new(),
                }))
            }
        }

        /// Clock whose sleeps return immediately and advance its time.
        pub struct ManualClock {
            now: Mutex<DateTime<Utc>>,
            sleeps: Mutex<Vec<Duration>>,
        }

        impl ManualClock {
            pub fn new(start: DateTime<Utc>) -> Self {
                Self {
                    now: Mutex::new(start),
                    sleeps: Mutex::new(Vec::new()),
                }
            }

            pub fn advance(&self, by: chrono::Duration) {
                *self.now.lock() += by;
            }

            pub fn sleeps(&self) -> Vec<Duration> {
                self.sleeps.lock().clone()
            }
        }

        impl Default for ManualClock {
            fn default() -> Self {
                Self::new(Utc::now())
            }
        }

        #[async_trait]
        impl Clock for ManualClock {
            fn now(&self) -> DateTime<Utc> {
                *self.now.lock()
            }

            async fn sleep(&self, duration: Duration) {
                self.sleeps.lock().push(duration);
                let step = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());
                *self.now.lock() += step;
            }
        }

        /// One set of doubles, kept typed so tests can inspect them.
        #[derive(Clone, Default)]
        pub struct MemoryServices {
            pub checkpoints: Arc<MemoryCheckpointStore>,
            pub catalog: Arc<MemoryCatalog>,
            pub source: Arc<ScriptedSource>,
            pub clock: Arc<ManualClock>,
        }

        impl MemoryServices {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn services(&self) -> ImportServices {
                ImportServices {
                    checkpoints: self.checkpoints.clone(),
                    catalog: self.catalog.clone(),
                    source: self.source.clone(),
                    clock: self.clock.clone(),
                }
            }
        }
    }

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers_modules::postgres::Postgres;
        use testcontainers_modules::testcontainers::{
            ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("neither TEST_DATABASE_URL nor IMPORT_TEST_CONTAINERS=1 set")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral, migrated database for integration tests.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            /// Create a database on the server at `TEST_DATABASE_URL`, or in a
            /// disposable container when `IMPORT_TEST_CONTAINERS=1`.
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                    return Self::on_server(&url, None).await;
                }
                if std::env::var("IMPORT_TEST_CONTAINERS").is_ok_and(|value| value == "1") {
                    return Self::new().await;
                }
                Err(TestDatabaseError::MissingUrl)
            }

            /// Provision a fresh database inside a disposable Postgres container.
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().start().await?;
                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                Self::on_server(&admin_url, Some(container)).await
            }

            async fn on_server(
                admin_url: &str,
                container: Option<ContainerAsync<Postgres>>,
            ) -> Result<Self, TestDatabaseError> {
                let base_options: PgConnectOptions = admin_url.parse()?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let base_name = base_options
                    .get_database()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "postgres".to_string());

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await?;

                let new_db_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql).execute(&admin_pool).await?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(base_options.database(&new_db_name))
                    .await?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database(self.admin_options.clone(), &self.database_name).await?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", database_name);
            sqlx::query(&drop_sql).execute(&admin_pool).await?;
            Ok(())
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database(admin_options, &db_name).await;
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    pub struct TestRocketBuilder {
        rocket: Rocket<Build>,
    }

    impl Default for TestRocketBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment: Figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                rocket: rocket::custom(figment),
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.rocket = self.rocket.mount("/api/v1", routes);
            self
        }

        /// Manage any state the mounted routes need (controller, queue, pool).
        pub fn manage<T: Send + Sync + 'static>(mut self, state: T) -> Self {
            self.rocket = self.rocket.manage(state);
            self
        }

        pub fn build(self) -> Rocket<Build> {
            self.rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}

//! Collaborator seams of the import engine. Postgres-backed implementations
//! live in [`crate::import::database`] and [`crate::import::fetcher`]; the
//! in-memory doubles used by tests live in `test_support`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::import::error::{FetchError, StoreError};
use crate::import::run::{ActorId, ImportRun};
use crate::models::{Category, NewProduct, NewProductImage, Product, ProductImage};

/// Durable per-actor run checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn find(&self, actor: &ActorId) -> Result<Option<ImportRun>, StoreError>;

    /// Load the actor's run, creating an idle one on first use.
    async fn get_or_create(
        &self,
        actor: &ActorId,
        pause_minutes: i32,
    ) -> Result<ImportRun, StoreError>;

    /// Persist `run` if its generation is still current. Returns `false` when
    /// a restart or stop has superseded it, in which case nothing is written.
    async fn save(&self, run: &ImportRun) -> Result<bool, StoreError>;

    /// Reset cursor, counters and backoff and mark the run running.
    async fn restart(&self, actor: &ActorId, pause_minutes: i32)
    -> Result<ImportRun, StoreError>;

    /// Mark the run stopped and clear its cursor.
    async fn stop(&self, actor: &ActorId, pause_minutes: i32) -> Result<ImportRun, StoreError>;

    /// Record a fatal error against the given generation.
    async fn fail(&self, actor: &ActorId, generation: i64, message: &str)
    -> Result<(), StoreError>;
}

/// The catalog entities an import materializes.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_or_create_category(&self, name: &str) -> Result<Category, StoreError>;

    async fn find_category(&self, id: i32) -> Result<Option<Category>, StoreError>;

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError>;

    async fn product_exists(&self, external_id: &str) -> Result<bool, StoreError>;

    /// Insert a product. `None` means another product already owns the external id.
    async fn create_product(&self, product: &NewProduct) -> Result<Option<Product>, StoreError>;

    async fn add_image(&self, image: &NewProductImage) -> Result<ProductImage, StoreError>;
}

/// Raw response from the attachment origin, after redirects.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedAttachment {
    pub status: u16,
    pub final_url: String,
    /// Empty unless the origin answered with a success status.
    pub body: Vec<u8>,
}

#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedAttachment, FetchError>;
}

/// Wall clock plus suspension, so pauses can be observed without waiting in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Real time. Sleeping yields the task instead of blocking a thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// The collaborators one import engine instance runs against.
#[derive(Clone)]
pub struct ImportServices {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub source: Arc<dyn AttachmentSource>,
    pub clock: Arc<dyn Clock>,
}

//! Postgres-backed collaborators of the import engine.
//!
//! - Schema migrations
//! - Per-actor run checkpoints with generation fencing
//! - Catalog writes (categories, products, product images)

pub mod catalog;
pub mod checkpoint;
pub mod migration;

pub use catalog::PgCatalogStore;
pub use checkpoint::PgCheckpointStore;
pub use migration::run_migrations;

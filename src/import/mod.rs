//! Resumable catalog import engine.
//!
//! Tabular rows (header first) are turned into products, each optionally
//! carrying image attachments fetched from a remote origin that throttles
//! aggressive clients. The engine is built from a few cooperating parts:
//!
//! - [`row`]: column mapping, projection, attachment splitting, slug and price parsing
//! - [`governor`]: pause escalation on throttling, periodic burst pauses, request jitter
//! - [`fetcher`]: attachment downloads and the HTTP origin client
//! - [`importer`]: the row loop with per-row checkpointing
//! - [`controller`]: start, resume, restart, stop and status per actor
//! - [`queue`] and [`dispatcher`]: background execution with reschedule-on-pause
//! - [`database`]: Postgres implementations of the [`store`] seams
//!
//! Progress lives in one [`ImportRun`] per actor. A run survives process
//! restarts and resumes from the row after its cursor.

pub mod config;
pub mod controller;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod fetcher;
pub mod governor;
pub mod importer;
pub mod queue;
pub mod row;
pub mod run;
pub mod store;

pub use config::{DispatcherConfig, FetchConfig, GovernorConfig};
pub use controller::RunController;
pub use database::{PgCatalogStore, PgCheckpointStore, run_migrations};
pub use dispatcher::ImportDispatcher;
pub use error::{FetchError, ImportError, StoreError};
pub use fetcher::{AttachmentFetcher, FetchOutcome, HttpAttachmentSource};
pub use governor::RateLimitGovernor;
pub use importer::RowImporter;
pub use queue::{ImportJobQueue, JobStatus};
pub use row::{ColumnMapping, Preview, preview};
pub use run::{ActorId, ImportRequest, ImportRun, RunOutcome, RunResult, RunStatus, StatusView};
pub use store::{
    AttachmentSource, CatalogStore, CheckpointStore, Clock, FetchedAttachment, ImportServices,
    TokioClock,
};

use thiserror::Error;

use crate::import::row::MappingError;

/// Failures of the persistence collaborators (checkpoint and catalog stores, job queue).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to decode job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Transport-level failures while fetching an attachment. Never fatal to a run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("attachment HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid attachment origin pattern: {0}")]
    OriginPattern(#[from] regex::Error),
}

/// Errors that end an importer invocation without a [`RunResult`](crate::import::RunResult).
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid column mapping: {0}")]
    InvalidMapping(#[from] MappingError),
    #[error("start row must be at least 1, got {0}")]
    InvalidStartRow(i32),
    #[error("run for actor '{0}' failed and must be restarted")]
    RequiresRestart(String),
}

impl From<sqlx::Error> for ImportError {
    fn from(err: sqlx::Error) -> Self {
        ImportError::Store(StoreError::Database(err))
    }
}

impl ImportError {
    /// Fatal errors move the run into `error`; caller mistakes leave it untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ImportError::Store(_))
    }
}

use confsync_core::ConfsyncError;
use confsync_jobs::JobError;
use thiserror::Error;

use crate::remote::RemoteError;

/// Errors that abort a pipeline or a pipeline-side store operation.
///
/// Single-record failures never surface here; they are counted in the
/// per-category summary instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Cancellation observed at a checkpoint. Maps to the job's
    /// `cancelled` state, never `failed`.
    #[error("operation cancelled")]
    Cancelled,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("remote error: {0}")]
    Remote(RemoteError),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl From<RemoteError> for PipelineError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Auth(msg) => PipelineError::Authentication(msg),
            other => PipelineError::Remote(other),
        }
    }
}

impl From<zip::result::ZipError> for PipelineError {
    fn from(e: zip::result::ZipError) -> Self {
        PipelineError::Archive(e.to_string())
    }
}

impl From<PipelineError> for ConfsyncError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Cancelled => ConfsyncError::Cancelled,
            PipelineError::Authentication(msg) => ConfsyncError::Authentication(msg),
            PipelineError::Remote(e) => ConfsyncError::Remote(e.to_string()),
            PipelineError::NotFound { what, id } => ConfsyncError::NotFound { what, id },
            PipelineError::Validation(msg) => ConfsyncError::Validation(msg),
            PipelineError::Archive(msg) => ConfsyncError::Internal(msg),
            PipelineError::Io(e) => ConfsyncError::Io(e),
            PipelineError::Database(e) => ConfsyncError::Database(e.to_string()),
            PipelineError::Serialization(e) => ConfsyncError::Serialization(e),
            PipelineError::Job(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

use confsync_core::ConfsyncError;
use thiserror::Error;

use crate::types::JobStatus;

/// Errors that can occur during job registry operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job is neither active nor in history.
    #[error("job not found: {id}")]
    NotFound { id: String },

    /// The requested state change is not allowed from the current state.
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored result or snapshot could not be (de)serialised.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<JobError> for ConfsyncError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound { id } => ConfsyncError::not_found("job", id),
            JobError::InvalidTransition { .. } => ConfsyncError::Conflict(e.to_string()),
            JobError::Database(e) => ConfsyncError::Database(e.to_string()),
            JobError::Serialization(e) => ConfsyncError::Serialization(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

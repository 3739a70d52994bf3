use confsync_core::ConfsyncError;
use confsync_jobs::JobError;
use confsync_pipeline::PipelineError;
use thiserror::Error;

use crate::cron::CronParseError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The trigger does not parse as a cron expression.
    #[error("invalid schedule expression '{expression}': {source}")]
    InvalidExpression {
        expression: String,
        #[source]
        source: CronParseError,
    },

    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid schedule: {0}")]
    Validation(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// The schedule's run guard is held by another job.
    #[error("schedule {schedule_id} is already running (job {job_id})")]
    AlreadyRunning { schedule_id: String, job_id: String },

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl SchedulerError {
    pub(crate) fn not_found(what: &'static str, id: &str) -> Self {
        SchedulerError::NotFound {
            what,
            id: id.to_string(),
        }
    }
}

impl From<SchedulerError> for ConfsyncError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Database(e) => ConfsyncError::Database(e.to_string()),
            SchedulerError::Serialization(e) => ConfsyncError::Serialization(e),
            e @ (SchedulerError::InvalidExpression { .. }
            | SchedulerError::InvalidTimezone(_)
            | SchedulerError::Validation(_)) => ConfsyncError::Validation(e.to_string()),
            SchedulerError::NotFound { what, id } => ConfsyncError::NotFound { what, id },
            e @ SchedulerError::AlreadyRunning { .. } => ConfsyncError::Conflict(e.to_string()),
            SchedulerError::Job(e) => e.into(),
            SchedulerError::Pipeline(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

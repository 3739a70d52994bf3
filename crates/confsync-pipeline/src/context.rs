use std::sync::Arc;

use confsync_jobs::JobRegistry;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// What an executor sees of the job it is running.
///
/// Carries the job id, a handle to the registry for progress and log
/// lines, and the cancellation token `cancel_job` fires.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    registry: Arc<JobRegistry>,
    token: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, registry: Arc<JobRegistry>) -> Self {
        let job_id = job_id.into();
        let token = registry
            .cancellation_token(&job_id)
            .unwrap_or_else(CancellationToken::new);
        Self {
            job_id,
            registry,
            token,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancellation checkpoint. Call before every page fetch, before every
    /// destructive remote write and between categories.
    pub fn checkpoint(&self) -> Result<()> {
        if self.token.is_cancelled() || self.registry.is_cancel_requested(&self.job_id) {
            debug!(job_id = %self.job_id, "cancellation observed at checkpoint");
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Progress update without a log line.
    pub fn progress(&self, percent: u8, message: &str) -> Result<()> {
        self.registry.set_progress(&self.job_id, percent, message, false)?;
        Ok(())
    }

    /// Progress update that is also written to the job log.
    pub fn milestone(&self, percent: u8, message: &str) -> Result<()> {
        self.registry.set_progress(&self.job_id, percent, message, true)?;
        Ok(())
    }

    pub fn log(&self, message: impl Into<String>) -> Result<()> {
        self.registry.log(&self.job_id, message)?;
        Ok(())
    }
}

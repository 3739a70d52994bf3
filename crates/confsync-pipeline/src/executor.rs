use std::sync::Arc;

use async_trait::async_trait;
use confsync_core::{CategorySet, TaskKind};
use confsync_jobs::{JobRegistry, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::artifacts::{BackupStore, WorkDirs};
use crate::connections::ConnectionProfile;
use crate::context::JobContext;
use crate::error::{PipelineError, Result};
use crate::remote::{ClientFactory, RemoteClient};
use crate::{backup, restore, sync};

/// Where a finished backup archive goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackupTarget {
    /// Stays in the job's work dir until downloaded or cleaned up.
    Download,
    /// Moved into the backups directory and recorded in the catalog.
    Catalog { schedule_id: Option<String> },
}

/// One unit of work for a [`TaskExecutor`].
#[derive(Debug, Clone)]
pub enum TaskRequest {
    Backup {
        source: ConnectionProfile,
        categories: CategorySet,
        target: BackupTarget,
    },
    Restore {
        destination: ConnectionProfile,
        backup_id: String,
        categories: CategorySet,
    },
    Sync {
        source: ConnectionProfile,
        destination: ConnectionProfile,
        categories: CategorySet,
    },
}

impl TaskRequest {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskRequest::Backup { .. } => TaskKind::Backup,
            TaskRequest::Restore { .. } => TaskKind::Restore,
            TaskRequest::Sync { .. } => TaskKind::Sync,
        }
    }

    pub fn categories(&self) -> &CategorySet {
        match self {
            TaskRequest::Backup { categories, .. }
            | TaskRequest::Restore { categories, .. }
            | TaskRequest::Sync { categories, .. } => categories,
        }
    }
}

/// Runs a [`TaskRequest`] for a job that is already `running`.
///
/// Returns the result summary on success. [`PipelineError::Cancelled`]
/// means a checkpoint observed cancellation.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &JobContext, request: &TaskRequest) -> Result<Value>;
}

/// The production executor: talks to remote instances over HTTP and keeps
/// archives on local disk.
pub struct Pipeline {
    pub(crate) clients: Arc<dyn ClientFactory>,
    pub(crate) work_dirs: Arc<WorkDirs>,
    pub(crate) backups: Arc<BackupStore>,
    pub(crate) page_size: u32,
}

impl Pipeline {
    pub fn new(
        clients: Arc<dyn ClientFactory>,
        work_dirs: Arc<WorkDirs>,
        backups: Arc<BackupStore>,
        page_size: u32,
    ) -> Self {
        Self {
            clients,
            work_dirs,
            backups,
            page_size: page_size.max(1),
        }
    }

    pub fn work_dirs(&self) -> &Arc<WorkDirs> {
        &self.work_dirs
    }

    /// Build a client for `profile` and authenticate it.
    pub(crate) async fn connect(
        &self,
        ctx: &JobContext,
        profile: &ConnectionProfile,
    ) -> Result<Arc<dyn RemoteClient>> {
        ctx.log(format!("Authenticating with {}", profile.name))?;
        let client = self.clients.client_for(profile)?;
        client.authenticate().await?;
        Ok(client)
    }
}

#[async_trait]
impl TaskExecutor for Pipeline {
    async fn execute(&self, ctx: &JobContext, request: &TaskRequest) -> Result<Value> {
        match request {
            TaskRequest::Backup {
                source,
                categories,
                target,
            } => backup::run(self, ctx, source, categories, target).await,
            TaskRequest::Restore {
                destination,
                backup_id,
                categories,
            } => restore::run(self, ctx, destination, backup_id, categories).await,
            TaskRequest::Sync {
                source,
                destination,
                categories,
            } => sync::run(self, ctx, source, destination, categories).await,
        }
    }
}

/// Terminal view of a job after [`run_job`] returns.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub job_id: String,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Drive `request` for the pending job `job_id` to a terminal state.
///
/// The executor runs on its own task so a panic fails the job instead of
/// leaving it `running`. Cancellation observed by the executor becomes
/// `cancelled`; any other error becomes `failed` with the message kept.
pub async fn run_job(
    registry: Arc<JobRegistry>,
    executor: Arc<dyn TaskExecutor>,
    job_id: String,
    request: TaskRequest,
) -> RunOutcome {
    if let Err(e) = registry.start_job(&job_id) {
        warn!(job_id = %job_id, error = %e, "job could not be started");
        return outcome(&registry, job_id);
    }

    let ctx = JobContext::new(job_id.clone(), Arc::clone(&registry));
    let kind = request.kind();
    let handle = tokio::spawn(async move { executor.execute(&ctx, &request).await });

    let finished = match handle.await {
        Ok(Ok(summary)) => registry.complete_job(&job_id, summary),
        Ok(Err(PipelineError::Cancelled)) => {
            info!(job_id = %job_id, %kind, "job stopped at cancellation checkpoint");
            registry.cancel_job(&job_id, "Cancelled")
        }
        Ok(Err(e)) => registry.fail_job(&job_id, &e.to_string()),
        Err(join) => {
            error!(job_id = %job_id, %kind, "executor task aborted: {join}");
            registry.fail_job(&job_id, &format!("executor task aborted: {join}"))
        }
    };
    if let Err(e) = finished {
        error!(job_id = %job_id, error = %e, "could not record job outcome");
    }

    outcome(&registry, job_id)
}

fn outcome(registry: &JobRegistry, job_id: String) -> RunOutcome {
    match registry.get_job(&job_id) {
        Some(job) => RunOutcome {
            job_id,
            status: job.status,
            result: job.result,
            error: job.error,
        },
        None => RunOutcome {
            job_id,
            status: JobStatus::Failed,
            result: None,
            error: Some("job disappeared from the registry".to_string()),
        },
    }
}

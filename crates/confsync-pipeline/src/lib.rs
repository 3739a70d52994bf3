//! `confsync-pipeline`: the shape every long-running operation follows.
//!
//! Backup, restore and sync all authenticate against a remote instance,
//! walk the selected [`Category`](confsync_core::Category) list in a fixed
//! order, report weighted progress into the job registry, stop at
//! cooperative cancellation checkpoints and isolate per-record failures.
//!
//! [`run_job`] is the entry point used by both the HTTP layer and the
//! scheduler: it drives a [`TaskExecutor`] and maps its outcome onto the
//! job's terminal state.

pub mod artifacts;
pub mod backup;
pub mod categories;
pub mod connections;
pub mod context;
pub mod db;
pub mod error;
pub mod executor;
pub mod http_client;
pub mod paginate;
pub mod progress;
pub mod remote;
pub mod restore;
pub mod sync;
pub mod upsert;

pub use artifacts::{BackupRecord, BackupStore, WorkDirs};
pub use connections::{ConnectionDraft, ConnectionProfile, ConnectionStore};
pub use context::JobContext;
pub use progress::ProgressTracker;
pub use upsert::CategoryStats;
pub use error::{PipelineError, Result};
pub use executor::{run_job, BackupTarget, Pipeline, RunOutcome, TaskExecutor, TaskRequest};
pub use http_client::{HttpClientFactory, HttpRemoteClient};
pub use remote::{ClientFactory, RemoteClient, RemoteError};

//! `confsync-jobs`: registry of long-running operations.
//!
//! Every backup, restore and sync runs as a [`Job`]. The [`JobRegistry`]
//! owns their lifecycle, buffers their log lines, keeps a bounded history of
//! terminal snapshots and writes everything through to SQLite so a restart
//! never leaves a job stuck in `running`.

pub mod db;
pub mod error;
pub mod registry;
pub mod types;

pub use error::{JobError, Result};
pub use registry::{JobRegistry, RegistrySettings, INTERRUPTED_ERROR};
pub use types::{Job, JobStatus, LogEntry};

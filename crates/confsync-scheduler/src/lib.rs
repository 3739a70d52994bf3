//! `confsync-scheduler`: recurring backups and syncs driven by cron
//! expressions evaluated in a configurable IANA timezone.
//!
//! # Overview
//!
//! Schedules are persisted in SQLite. The [`Scheduler`] keeps one tokio
//! timer per enabled schedule; each fire creates a job in the
//! [`JobRegistry`](confsync_jobs::JobRegistry) and hands a
//! [`TaskRequest`](confsync_pipeline::TaskRequest) to the executor. A
//! per-schedule run guard keeps at most one run of a schedule in flight.
//!
//! # Triggers
//!
//! | Preset    | Expression    |
//! |-----------|---------------|
//! | `hourly`  | `0 * * * *`   |
//! | `daily`   | `0 2 * * *`   |
//! | `weekly`  | `0 2 * * 0`   |
//! | `monthly` | `0 2 1 * *`   |
//!
//! Custom triggers take any standard five-field expression.

pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod retention;
pub mod store;
pub mod types;

pub use cron::{parse_timezone, CronExpr, CronParseError};
pub use engine::{Scheduler, PREVIEW_RUNS, TIMEZONE_SETTING};
pub use error::{Result, SchedulerError};
pub use retention::apply_retention;
pub use store::ScheduleStore;
pub use types::{
    LastRun, Preset, RunHistoryEntry, RunStatus, Schedule, ScheduleDraft, ScheduleKind, Trigger,
};

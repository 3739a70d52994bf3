use chrono::{DateTime, Utc};
use confsync_core::{CategorySet, TaskKind};
use confsync_jobs::JobStatus;
use serde::{Deserialize, Serialize};

use crate::cron::{CronExpr, CronParseError};

/// What a schedule runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Backup,
    Sync,
}

impl ScheduleKind {
    pub fn task_kind(&self) -> TaskKind {
        match self {
            ScheduleKind::Backup => TaskKind::Backup,
            ScheduleKind::Sync => TaskKind::Sync,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Backup => "backup",
            ScheduleKind::Sync => "sync",
        }
    }
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "backup" => Ok(ScheduleKind::Backup),
            "sync" => Ok(ScheduleKind::Sync),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

/// Named trigger presets and the expressions they stand for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Preset {
    pub fn expression(&self) -> &'static str {
        match self {
            Preset::Hourly => "0 * * * *",
            Preset::Daily => "0 2 * * *",
            Preset::Weekly => "0 2 * * 0",
            Preset::Monthly => "0 2 1 * *",
        }
    }
}

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Preset { preset: Preset },
    Custom { expression: String },
}

impl Trigger {
    pub fn expression(&self) -> &str {
        match self {
            Trigger::Preset { preset } => preset.expression(),
            Trigger::Custom { expression } => expression,
        }
    }

    pub fn resolve(&self) -> Result<CronExpr, CronParseError> {
        CronExpr::parse(self.expression())
    }
}

/// Outcome of one schedule run as recorded in its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl From<JobStatus> for RunStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Completed => RunStatus::Completed,
            JobStatus::Cancelled => RunStatus::Cancelled,
            JobStatus::Failed => RunStatus::Failed,
            JobStatus::Pending | JobStatus::Running => RunStatus::Running,
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Pointer to the most recent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    pub job_id: String,
    pub status: RunStatus,
    pub at: DateTime<Utc>,
}

/// A persisted recurring backup or sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub kind: ScheduleKind,
    pub source_id: String,
    /// Cached so the schedule stays readable after the connection is deleted.
    pub source_name: String,
    pub destination_id: Option<String>,
    pub destination_name: Option<String>,
    pub categories: CategorySet,
    pub trigger: Trigger,
    pub enabled: bool,
    /// Keep at most this many backups; `None` keeps everything.
    pub retention_count: Option<u32>,
    pub last_run: Option<LastRun>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields for create and full update.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleDraft {
    pub name: String,
    pub kind: ScheduleKind,
    pub source_id: String,
    #[serde(default)]
    pub destination_id: Option<String>,
    #[serde(default = "CategorySet::all")]
    pub categories: CategorySet,
    pub trigger: Trigger,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub retention_count: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

/// One row of a schedule's run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub id: String,
    pub schedule_id: String,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_resolve_to_fixed_expressions() {
        for (preset, expr) in [
            (Preset::Hourly, "0 * * * *"),
            (Preset::Daily, "0 2 * * *"),
            (Preset::Weekly, "0 2 * * 0"),
            (Preset::Monthly, "0 2 1 * *"),
        ] {
            let trigger = Trigger::Preset { preset };
            assert_eq!(trigger.expression(), expr);
            assert!(trigger.resolve().is_ok());
        }
    }

    #[test]
    fn trigger_json_shape() {
        let t: Trigger = serde_json::from_str(r#"{"type":"preset","preset":"daily"}"#).unwrap();
        assert_eq!(t, Trigger::Preset { preset: Preset::Daily });
        let t: Trigger = serde_json::from_str(r#"{"type":"custom","expression":"*/5 * * * *"}"#).unwrap();
        assert_eq!(t.expression(), "*/5 * * * *");
    }

    #[test]
    fn draft_defaults() {
        let d: ScheduleDraft = serde_json::from_str(
            r#"{"name":"nightly","kind":"backup","source_id":"c1","trigger":{"type":"preset","preset":"daily"}}"#,
        )
        .unwrap();
        assert!(d.enabled);
        assert_eq!(d.categories, CategorySet::all());
        assert_eq!(d.retention_count, None);
    }
}

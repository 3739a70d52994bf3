// A registry reopened over the same SQLite file must never report a job as
// still running, and must keep everything that reached a terminal state.

use confsync_core::TaskKind;
use confsync_jobs::{JobRegistry, JobStatus, RegistrySettings, INTERRUPTED_ERROR};
use rusqlite::Connection;
use serde_json::json;

fn open(path: &std::path::Path) -> JobRegistry {
    JobRegistry::open(
        Connection::open(path).unwrap(),
        RegistrySettings {
            log_flush_every: 2,
            ..RegistrySettings::default()
        },
    )
    .unwrap()
}

#[test]
fn running_job_is_failed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");

    let (running, pending) = {
        let reg = open(&path);
        let running = reg.create_job(TaskKind::Sync).unwrap();
        reg.start_job(&running).unwrap();
        reg.set_progress(&running, 35, "Syncing channels", false).unwrap();
        let pending = reg.create_job(TaskKind::Backup).unwrap();
        (running, pending)
    };

    let reg = open(&path);
    for id in [&running, &pending] {
        let job = reg.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert_eq!(job.completed_at, Some(job.updated_at));
    }
    assert_eq!(reg.get_job(&running).unwrap().progress, 35);
    assert!(reg.get_all_jobs().is_empty());
    assert_eq!(reg.get_history().len(), 2);
}

#[test]
fn terminal_jobs_and_logs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");

    let id = {
        let reg = open(&path);
        let id = reg.create_job(TaskKind::Backup).unwrap();
        reg.start_job(&id).unwrap();
        reg.log(&id, "Authenticated").unwrap();
        reg.set_progress(&id, 50, "Exporting users", true).unwrap();
        reg.log(&id, "Writing archive").unwrap();
        reg.complete_job(&id, json!({"categories": 2})).unwrap();
        id
    };

    let reg = open(&path);
    let job = reg.get_job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"categories": 2})));

    let logs: Vec<String> = reg.get_logs(&id).unwrap().into_iter().map(|l| l.message).collect();
    assert_eq!(
        logs,
        vec!["Authenticated", "Exporting users (50%)", "Writing archive"]
    );

    let history = reg.get_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, id);
}

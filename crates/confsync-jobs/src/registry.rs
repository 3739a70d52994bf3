use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use confsync_core::config::{JobsConfig, JOB_HISTORY_LIMIT, JOB_RETENTION_SECS, LOG_FLUSH_EVERY};
use confsync_core::{new_id, TaskKind};
use rusqlite::Connection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::db;
use crate::error::{JobError, Result};
use crate::types::{Job, JobStatus, LogEntry};

/// Error recorded on jobs found pending/running when the registry opens.
pub const INTERRUPTED_ERROR: &str = "Interrupted by server restart";

/// Tunables for the registry, normally taken from `[jobs]` config.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// How long a terminal job stays in the active map.
    pub retention: chrono::Duration,
    pub history_limit: usize,
    /// Log lines are written to SQLite in batches of this size.
    pub log_flush_every: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::seconds(JOB_RETENTION_SECS as i64),
            history_limit: JOB_HISTORY_LIMIT,
            log_flush_every: LOG_FLUSH_EVERY,
        }
    }
}

impl From<&JobsConfig> for RegistrySettings {
    fn from(cfg: &JobsConfig) -> Self {
        Self {
            retention: chrono::Duration::seconds(cfg.retention_secs as i64),
            history_limit: cfg.history_limit.max(1),
            log_flush_every: cfg.log_flush_every.max(1),
        }
    }
}

struct JobLog {
    entries: Vec<LogEntry>,
    /// Index of the first entry not yet written to SQLite.
    flushed: usize,
}

struct Inner {
    db: Connection,
    jobs: HashMap<String, Job>,
    logs: HashMap<String, JobLog>,
    tokens: HashMap<String, CancellationToken>,
    /// Terminal snapshots, oldest first.
    history: VecDeque<Job>,
}

/// Tracks every job's lifecycle, logs and bounded history.
///
/// Thread-safe: the SQLite connection and all in-memory maps live behind one
/// `Mutex`, so each operation is atomic with respect to the others. The lock
/// is never held across an `.await`.
pub struct JobRegistry {
    inner: Mutex<Inner>,
    settings: RegistrySettings,
}

impl JobRegistry {
    /// Open the registry over `conn` with default settings.
    pub fn new(conn: Connection) -> Result<Self> {
        Self::open(conn, RegistrySettings::default())
    }

    /// Open the registry, loading persisted jobs and history.
    ///
    /// Any job still pending or running was interrupted by a restart: it is
    /// failed with [`INTERRUPTED_ERROR`] and `completed_at` backdated to its
    /// last persisted update.
    pub fn open(conn: Connection, settings: RegistrySettings) -> Result<Self> {
        db::init_db(&conn)?;

        let mut history: VecDeque<Job> = db::load_history(&conn)?.into();
        while history.len() > settings.history_limit {
            history.pop_front();
        }

        let mut jobs = HashMap::new();
        let mut logs = HashMap::new();
        let mut recovered = 0usize;
        for mut job in db::load_jobs(&conn)? {
            if job.status.is_active() {
                job.status = JobStatus::Failed;
                job.error = Some(INTERRUPTED_ERROR.to_string());
                job.completed_at = Some(job.updated_at);
                db::upsert_job(&conn, &job)?;
                db::record_snapshot(&conn, &job, settings.history_limit)?;
                push_history(&mut history, job.clone(), settings.history_limit);
                recovered += 1;
            }
            let entries = db::load_logs(&conn, &job.id)?;
            let flushed = entries.len();
            logs.insert(job.id.clone(), JobLog { entries, flushed });
            jobs.insert(job.id.clone(), job);
        }

        if recovered > 0 {
            warn!(count = recovered, "jobs interrupted by restart marked failed");
        }
        info!(jobs = jobs.len(), history = history.len(), "job registry loaded");

        Ok(Self {
            inner: Mutex::new(Inner {
                db: conn,
                jobs,
                logs,
                tokens: HashMap::new(),
                history,
            }),
            settings,
        })
    }

    /// Create a pending job and return its id.
    #[instrument(skip(self))]
    pub fn create_job(&self, kind: TaskKind) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let id = new_id();
        let job = Job::new(id.clone(), kind, Utc::now());
        db::upsert_job(&inner.db, &job)?;
        inner.jobs.insert(id.clone(), job);
        inner.logs.insert(
            id.clone(),
            JobLog {
                entries: Vec::new(),
                flushed: 0,
            },
        );
        inner.tokens.insert(id.clone(), CancellationToken::new());
        debug!(job_id = %id, %kind, "job created");
        Ok(id)
    }

    /// pending → running.
    pub fn start_job(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let job = active_job(&mut inner, id)?;
        if job.status != JobStatus::Pending {
            return Err(JobError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to: JobStatus::Running,
            });
        }
        let now = Utc::now();
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;
        let job = job.clone();
        db::upsert_job(&inner.db, &job)?;
        info!(job_id = %id, kind = %job.kind, "job started");
        Ok(())
    }

    /// Report progress for a running job.
    ///
    /// The value is clamped to 100 and never lowers the current progress.
    /// With `log` set, also appends `"{message} ({N}%)"` to the job log.
    /// Updates for jobs that are not running are ignored.
    pub fn set_progress(&self, id: &str, value: u8, message: &str, log: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let job = active_job(&mut inner, id)?;
        if job.status != JobStatus::Running {
            debug!(job_id = %id, status = %job.status, "progress update ignored");
            return Ok(());
        }
        let progress = value.min(100).max(job.progress);
        job.progress = progress;
        job.message = Some(message.to_string());
        job.updated_at = Utc::now();
        let job = job.clone();
        db::upsert_job(&inner.db, &job)?;
        if log {
            self.append_log(&mut inner, id, format!("{message} ({progress}%)"))?;
        }
        Ok(())
    }

    /// Append a line to the job log.
    pub fn log(&self, id: &str, message: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.jobs.contains_key(id) {
            return Err(JobError::NotFound { id: id.to_string() });
        }
        self.append_log(&mut inner, id, message.into())
    }

    /// Mark the job completed with `result`.
    ///
    /// A job that was cancelled in the meantime stays cancelled.
    pub fn complete_job(&self, id: &str, result: serde_json::Value) -> Result<()> {
        self.finish(id, JobStatus::Completed, |job| {
            job.progress = 100;
            job.result = Some(result);
            job.message = Some("Completed".to_string());
        })
    }

    /// Mark the job failed, preserving `error` verbatim.
    pub fn fail_job(&self, id: &str, error: &str) -> Result<()> {
        self.finish(id, JobStatus::Failed, |job| {
            job.error = Some(error.to_string());
        })
    }

    /// Cancel a pending or running job.
    ///
    /// Signals the job's cancellation token; the executor stops at its next
    /// checkpoint. Cancelling an already-cancelled job is a no-op.
    pub fn cancel_job(&self, id: &str, reason: &str) -> Result<()> {
        let token = {
            let inner = self.inner.lock().unwrap();
            inner.tokens.get(id).cloned()
        };
        self.finish(id, JobStatus::Cancelled, |job| {
            job.message = Some(reason.to_string());
            job.error = Some(reason.to_string());
        })?;
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    fn finish(&self, id: &str, to: JobStatus, apply: impl FnOnce(&mut Job)) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let job = active_job(&mut inner, id)?;
        if job.status.is_terminal() {
            if job.status == JobStatus::Cancelled {
                debug!(job_id = %id, requested = %to, "job already cancelled; keeping cancelled");
                return Ok(());
            }
            return Err(JobError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to,
            });
        }

        let now = Utc::now();
        apply(&mut *job);
        job.status = to;
        job.completed_at = Some(now);
        job.updated_at = now;
        let job = job.clone();

        db::upsert_job(&inner.db, &job)?;
        self.flush_logs(&mut inner, id)?;
        db::record_snapshot(&inner.db, &job, self.settings.history_limit)?;
        push_history(&mut inner.history, job.clone(), self.settings.history_limit);

        match to {
            JobStatus::Failed => warn!(
                job_id = %id,
                kind = %job.kind,
                error = job.error.as_deref().unwrap_or(""),
                "job failed"
            ),
            _ => info!(job_id = %id, kind = %job.kind, status = %to, "job finished"),
        }
        Ok(())
    }

    /// Active job by id, falling back to its history snapshot.
    pub fn get_job(&self, id: &str) -> Option<Job> {
        let inner = self.inner.lock().unwrap();
        inner
            .jobs
            .get(id)
            .cloned()
            .or_else(|| inner.history.iter().rev().find(|j| j.id == id).cloned())
    }

    /// Pending and running jobs, oldest first.
    pub fn get_all_jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status.is_active())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Terminal snapshots, newest first.
    pub fn get_history(&self) -> Vec<Job> {
        let inner = self.inner.lock().unwrap();
        inner.history.iter().rev().cloned().collect()
    }

    /// Log lines of a job. Jobs that were already swept have no logs left.
    pub fn get_logs(&self, id: &str) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock().unwrap();
        if let Some(log) = inner.logs.get(id) {
            return Ok(log.entries.clone());
        }
        if inner.history.iter().any(|j| j.id == id) {
            return Ok(Vec::new());
        }
        Err(JobError::NotFound { id: id.to_string() })
    }

    /// True once `cancel_job` has been called for this job.
    pub fn is_cancel_requested(&self, id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .jobs
            .get(id)
            .map(|j| j.status == JobStatus::Cancelled)
            .unwrap_or(false)
    }

    /// Token fired by `cancel_job`, for executors that await on it.
    pub fn cancellation_token(&self, id: &str) -> Option<CancellationToken> {
        let inner = self.inner.lock().unwrap();
        inner.tokens.get(id).cloned()
    }

    /// Drop terminal jobs whose `completed_at` is older than the retention
    /// window from the active map and the jobs tables. History is untouched.
    ///
    /// Returns the ids that were evicted.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = now - self.settings.retention;
        let expired: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.completed_at.is_some_and(|at| at <= cutoff))
            .map(|j| j.id.clone())
            .collect();

        for id in &expired {
            db::delete_job(&inner.db, id)?;
            inner.jobs.remove(id);
            inner.logs.remove(id);
            inner.tokens.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired jobs swept");
        }
        Ok(expired)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// `shutdown` fires. `on_evict` receives each non-empty batch of swept
    /// ids so resources keyed by job id can be released with the job.
    pub fn spawn_sweeper<F>(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
        on_evict: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&[String]) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep_expired(Utc::now()) {
                            Ok(swept) if !swept.is_empty() => on_evict(&swept),
                            Ok(_) => {}
                            Err(e) => error!("job sweep failed: {e}"),
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("job sweeper stopped");
        })
    }

    fn append_log(&self, inner: &mut Inner, id: &str, message: String) -> Result<()> {
        let should_flush = {
            let log = inner.logs.entry(id.to_string()).or_insert_with(|| JobLog {
                entries: Vec::new(),
                flushed: 0,
            });
            log.entries.push(LogEntry {
                timestamp: Utc::now(),
                message,
            });
            log.entries.len() - log.flushed >= self.settings.log_flush_every
        };
        if should_flush {
            self.flush_logs(inner, id)?;
        }
        Ok(())
    }

    fn flush_logs(&self, inner: &mut Inner, id: &str) -> Result<()> {
        let Inner { db, logs, .. } = inner;
        if let Some(log) = logs.get_mut(id) {
            if log.flushed < log.entries.len() {
                db::insert_logs(db, id, log.flushed, &log.entries[log.flushed..])?;
                log.flushed = log.entries.len();
            }
        }
        Ok(())
    }
}

fn active_job<'a>(inner: &'a mut Inner, id: &str) -> Result<&'a mut Job> {
    inner
        .jobs
        .get_mut(id)
        .ok_or_else(|| JobError::NotFound { id: id.to_string() })
}

fn push_history(history: &mut VecDeque<Job>, job: Job, limit: usize) {
    history.retain(|j| j.id != job.id);
    history.push_back(job);
    while history.len() > limit {
        history.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> JobRegistry {
        JobRegistry::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn create_starts_pending_at_zero() {
        let reg = registry();
        let id = reg.create_job(TaskKind::Backup).unwrap();
        let job = reg.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.completed_at.is_none());
        assert_eq!(reg.get_all_jobs().len(), 1);
    }

    #[test]
    fn progress_never_decreases_and_logs_combined_line() {
        let reg = registry();
        let id = reg.create_job(TaskKind::Sync).unwrap();
        reg.start_job(&id).unwrap();

        reg.set_progress(&id, 40, "Syncing channels", true).unwrap();
        reg.set_progress(&id, 25, "Syncing logos", false).unwrap();
        reg.set_progress(&id, 250, "Almost", false).unwrap();

        let job = reg.get_job(&id).unwrap();
        assert_eq!(job.progress, 100);
        let logs = reg.get_logs(&id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "Syncing channels (40%)");
    }

    #[test]
    fn terminal_transition_stamps_completion_and_single_snapshot() {
        let reg = registry();
        let id = reg.create_job(TaskKind::Backup).unwrap();
        reg.start_job(&id).unwrap();
        reg.complete_job(&id, json!({"ok": true})).unwrap();

        let job = reg.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert_eq!(job.progress, 100);
        assert_eq!(reg.get_history().iter().filter(|j| j.id == id).count(), 1);
        assert!(reg.get_all_jobs().is_empty());
    }

    #[test]
    fn completion_after_cancel_keeps_cancelled() {
        let reg = registry();
        let id = reg.create_job(TaskKind::Sync).unwrap();
        reg.start_job(&id).unwrap();
        let token = reg.cancellation_token(&id).unwrap();

        reg.cancel_job(&id, "Cancelled by user").unwrap();
        assert!(token.is_cancelled());
        assert!(reg.is_cancel_requested(&id));

        reg.complete_job(&id, json!({})).unwrap();
        reg.fail_job(&id, "late failure").unwrap();

        let job = reg.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(reg.get_history().len(), 1);
    }

    #[test]
    fn finished_job_cannot_be_cancelled_or_restarted() {
        let reg = registry();
        let id = reg.create_job(TaskKind::Restore).unwrap();
        reg.start_job(&id).unwrap();
        reg.fail_job(&id, "boom").unwrap();

        assert!(matches!(
            reg.cancel_job(&id, "too late"),
            Err(JobError::InvalidTransition { .. })
        ));
        assert!(matches!(
            reg.start_job(&id),
            Err(JobError::InvalidTransition { .. })
        ));
        assert_eq!(reg.get_job(&id).unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn history_is_bounded_oldest_first_out() {
        let conn = Connection::open_in_memory().unwrap();
        let reg = JobRegistry::open(
            conn,
            RegistrySettings {
                history_limit: 3,
                ..RegistrySettings::default()
            },
        )
        .unwrap();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = reg.create_job(TaskKind::Backup).unwrap();
            reg.start_job(&id).unwrap();
            reg.complete_job(&id, json!({})).unwrap();
            ids.push(id);
        }

        let history: Vec<String> = reg.get_history().into_iter().map(|j| j.id).collect();
        assert_eq!(history, vec![ids[4].clone(), ids[3].clone(), ids[2].clone()]);
    }

    #[test]
    fn sweep_removes_expired_jobs_but_keeps_history() {
        let reg = registry();
        let done = reg.create_job(TaskKind::Backup).unwrap();
        reg.start_job(&done).unwrap();
        reg.complete_job(&done, json!({})).unwrap();
        let running = reg.create_job(TaskKind::Sync).unwrap();
        reg.start_job(&running).unwrap();

        assert!(reg.sweep_expired(Utc::now()).unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(reg.sweep_expired(later).unwrap(), vec![done.clone()]);

        // still resolvable through its history snapshot
        let job = reg.get_job(&done).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(reg.get_logs(&done).unwrap().is_empty());
        assert!(reg.get_job(&running).is_some());
    }

    #[tokio::test]
    async fn sweeper_hands_evicted_ids_to_callback() {
        let settings = RegistrySettings {
            retention: chrono::Duration::zero(),
            ..RegistrySettings::default()
        };
        let reg = Arc::new(JobRegistry::open(Connection::open_in_memory().unwrap(), settings).unwrap());
        let id = reg.create_job(TaskKind::Backup).unwrap();
        reg.start_job(&id).unwrap();
        reg.fail_job(&id, "boom").unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let sweeper = Arc::clone(&reg).spawn_sweeper(
            Duration::from_millis(10),
            shutdown.clone(),
            move |swept| {
                let _ = tx.send(swept.to_vec());
            },
        );

        let swept = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(swept, vec![id.clone()]);
        assert!(reg.sweep_expired(Utc::now()).unwrap().is_empty());

        shutdown.cancel();
        sweeper.await.unwrap();
    }

    #[test]
    fn unknown_job_is_not_found() {
        let reg = registry();
        assert!(reg.get_job("nope").is_none());
        assert!(matches!(reg.get_logs("nope"), Err(JobError::NotFound { .. })));
        assert!(matches!(reg.start_job("nope"), Err(JobError::NotFound { .. })));
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use confsync_core::new_id;
use confsync_jobs::JobRegistry;
use confsync_pipeline::{
    run_job, BackupStore, BackupTarget, ConnectionStore, RunOutcome, TaskExecutor, TaskRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cron::{parse_timezone, CronExpr};
use crate::error::{Result, SchedulerError};
use crate::retention::apply_retention;
use crate::store::ScheduleStore;
use crate::types::{LastRun, RunHistoryEntry, RunStatus, Schedule, ScheduleDraft, ScheduleKind};

/// Settings key holding the scheduling timezone.
pub const TIMEZONE_SETTING: &str = "timezone";
/// Fire times returned by [`Scheduler::validate_expression`].
pub const PREVIEW_RUNS: usize = 5;

type RunningMap = Arc<Mutex<HashMap<String, String>>>;

/// Owns one timer per enabled schedule and turns timer ticks into jobs.
///
/// Timers are tokio tasks that sleep until their next fire time and push
/// the schedule id into an mpsc channel. The dispatcher loop started by
/// [`start`](Self::start) receives ticks and runs
/// [`execute_schedule`](Self::execute_schedule) for each.
///
/// The run guard maps schedule id → job id. It is checked and set in the
/// same synchronous section that creates the job, and released by
/// [`RunGuard`] on every exit path.
pub struct Scheduler {
    store: Arc<ScheduleStore>,
    connections: Arc<ConnectionStore>,
    registry: Arc<JobRegistry>,
    executor: Arc<dyn TaskExecutor>,
    backups: Arc<BackupStore>,
    timezone: RwLock<Tz>,
    timers: Mutex<HashMap<String, CancellationToken>>,
    running: RunningMap,
    ticks: mpsc::UnboundedSender<String>,
    tick_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    shutdown: CancellationToken,
}

/// Clears the run-guard entry when dropped.
struct RunGuard {
    running: RunningMap,
    schedule_id: String,
    job_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.get(&self.schedule_id) == Some(&self.job_id) {
            running.remove(&self.schedule_id);
            debug!(schedule_id = %self.schedule_id, job_id = %self.job_id, "run guard released");
        }
    }
}

struct PreparedRun {
    schedule: Schedule,
    job_id: String,
    request: TaskRequest,
    guard: RunGuard,
}

impl Scheduler {
    /// Build a scheduler. The timezone persisted by an earlier
    /// [`reinitialize_with_timezone`](Self::reinitialize_with_timezone) wins
    /// over `default_timezone`.
    pub fn new(
        store: Arc<ScheduleStore>,
        connections: Arc<ConnectionStore>,
        registry: Arc<JobRegistry>,
        executor: Arc<dyn TaskExecutor>,
        backups: Arc<BackupStore>,
        default_timezone: &str,
    ) -> Result<Self> {
        let timezone = match store.get_setting(TIMEZONE_SETTING)? {
            Some(saved) => parse_timezone(&saved).unwrap_or_else(|| {
                warn!(timezone = %saved, "stored timezone is invalid; falling back to default");
                parse_timezone(default_timezone).unwrap_or(Tz::UTC)
            }),
            None => parse_timezone(default_timezone)
                .ok_or_else(|| SchedulerError::InvalidTimezone(default_timezone.to_string()))?,
        };
        let (ticks, tick_rx) = mpsc::unbounded_channel();

        Ok(Self {
            store,
            connections,
            registry,
            executor,
            backups,
            timezone: RwLock::new(timezone),
            timers: Mutex::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
            ticks,
            tick_rx: Mutex::new(Some(tick_rx)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn timezone(&self) -> Tz {
        *self.timezone.read().unwrap()
    }

    /// Register every enabled schedule and start the dispatcher loop.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut rx = self
            .tick_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SchedulerError::Validation("scheduler already started".into()))?;

        let mut registered = 0;
        for schedule in self.store.list()?.into_iter().filter(|s| s.enabled) {
            if self.schedule_job(&schedule).is_ok() {
                registered += 1;
            }
        }
        info!(registered, timezone = %self.timezone(), "scheduler started");

        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    tick = rx.recv() => {
                        let Some(schedule_id) = tick else { break };
                        let runner = Arc::clone(&this);
                        tokio::spawn(async move {
                            runner.execute_schedule(&schedule_id).await;
                        });
                    }
                    _ = this.shutdown.cancelled() => break,
                }
            }
            info!("scheduler dispatcher stopped");
        }))
    }

    /// Cancel every timer and stop the dispatcher. Runs already in flight
    /// finish on their own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut timers = self.timers.lock().unwrap();
        for (_, token) in timers.drain() {
            token.cancel();
        }
        info!("scheduler shut down");
    }

    /// (Re)register the timer for `schedule` and persist its next run time.
    ///
    /// An invalid expression is logged and returned as an error; the stored
    /// schedule is left untouched and no timer is registered.
    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id))]
    pub fn schedule_job(&self, schedule: &Schedule) -> Result<Option<DateTime<Utc>>> {
        self.unschedule_job(&schedule.id);

        let expr = schedule.trigger.resolve().map_err(|source| {
            error!(
                expression = schedule.trigger.expression(),
                error = %source,
                "schedule not registered: invalid expression"
            );
            SchedulerError::InvalidExpression {
                expression: schedule.trigger.expression().to_string(),
                source,
            }
        })?;

        let tz = self.timezone();
        let next = expr.next_after(Utc::now(), tz);
        self.store.set_next_run(&schedule.id, next)?;

        let token = self.spawn_timer(schedule.id.clone(), expr, tz);
        if let Some(previous) = self.timers.lock().unwrap().insert(schedule.id.clone(), token) {
            previous.cancel();
        }
        debug!(next_run_at = ?next, %tz, "schedule registered");
        Ok(next)
    }

    /// Stop and forget the schedule's timer. No-op when none is registered.
    pub fn unschedule_job(&self, schedule_id: &str) {
        if let Some(token) = self.timers.lock().unwrap().remove(schedule_id) {
            token.cancel();
            debug!(schedule_id, "schedule unregistered");
        }
    }

    pub fn is_registered(&self, schedule_id: &str) -> bool {
        self.timers.lock().unwrap().contains_key(schedule_id)
    }

    /// Job currently holding the schedule's run guard.
    pub fn running_job(&self, schedule_id: &str) -> Option<String> {
        self.running.lock().unwrap().get(schedule_id).cloned()
    }

    fn spawn_timer(&self, schedule_id: String, expr: CronExpr, tz: Tz) -> CancellationToken {
        let token = self.shutdown.child_token();
        let cancelled = token.clone();
        let ticks = self.ticks.clone();

        tokio::spawn(async move {
            // sleep is monotonic, `now` is wall clock: carry the last fire
            let mut last_fired: Option<DateTime<Utc>> = None;
            loop {
                let now = Utc::now();
                let Some(next) = expr.next_fire(now, last_fired, tz) else {
                    debug!(schedule_id = %schedule_id, "expression has no future fire time");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        debug!(schedule_id = %schedule_id, fire_at = %next, "timer fired");
                        last_fired = Some(next);
                        if ticks.send(schedule_id.clone()).is_err() {
                            break;
                        }
                    }
                    _ = cancelled.cancelled() => break,
                }
            }
        });
        token
    }

    /// Timer-driven run. Silently skipped when the schedule is already
    /// running; a missing schedule or connection is logged and no job is
    /// created.
    pub async fn execute_schedule(&self, schedule_id: &str) -> Option<RunOutcome> {
        match self.prepare_run(schedule_id) {
            Ok(run) => Some(self.finish_run(run).await),
            Err(SchedulerError::AlreadyRunning { job_id, .. }) => {
                debug!(schedule_id, job_id = %job_id, "schedule already running; tick skipped");
                self.refresh_next_run(schedule_id);
                None
            }
            Err(e) => {
                error!(schedule_id, error = %e, "scheduled run aborted");
                self.refresh_next_run(schedule_id);
                None
            }
        }
    }

    /// Start a run now, even if the schedule is disabled. Returns the new
    /// job id; the run continues in the background.
    pub fn trigger_manual_run(self: &Arc<Self>, schedule_id: &str) -> Result<String> {
        let run = self.prepare_run(schedule_id)?;
        let job_id = run.job_id.clone();
        info!(schedule_id, job_id = %job_id, "manual run triggered");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.finish_run(run).await;
        });
        Ok(job_id)
    }

    /// Resolve the schedule and its connections, then take the run guard
    /// and create the job, all without yielding.
    fn prepare_run(&self, schedule_id: &str) -> Result<PreparedRun> {
        let mut running = self.running.lock().unwrap();
        if let Some(job_id) = running.get(schedule_id) {
            return Err(SchedulerError::AlreadyRunning {
                schedule_id: schedule_id.to_string(),
                job_id: job_id.clone(),
            });
        }

        let schedule = self.store.require(schedule_id)?;
        let source = self
            .connections
            .get(&schedule.source_id)?
            .ok_or_else(|| SchedulerError::not_found("connection", &schedule.source_id))?;

        let request = match schedule.kind {
            ScheduleKind::Backup => TaskRequest::Backup {
                source,
                categories: schedule.categories.clone(),
                target: BackupTarget::Catalog {
                    schedule_id: Some(schedule.id.clone()),
                },
            },
            ScheduleKind::Sync => {
                let destination_id = schedule.destination_id.as_deref().ok_or_else(|| {
                    SchedulerError::Validation("sync schedule has no destination".into())
                })?;
                let destination = self
                    .connections
                    .get(destination_id)?
                    .ok_or_else(|| SchedulerError::not_found("connection", destination_id))?;
                TaskRequest::Sync {
                    source,
                    destination,
                    categories: schedule.categories.clone(),
                }
            }
        };

        let job_id = self.registry.create_job(schedule.kind.task_kind())?;
        running.insert(schedule_id.to_string(), job_id.clone());

        Ok(PreparedRun {
            guard: RunGuard {
                running: Arc::clone(&self.running),
                schedule_id: schedule_id.to_string(),
                job_id: job_id.clone(),
            },
            schedule,
            job_id,
            request,
        })
    }

    async fn finish_run(&self, run: PreparedRun) -> RunOutcome {
        let PreparedRun {
            schedule,
            job_id,
            request,
            guard,
        } = run;

        let started_at = Utc::now();
        let entry = RunHistoryEntry {
            id: new_id(),
            schedule_id: schedule.id.clone(),
            job_id: job_id.clone(),
            started_at,
            completed_at: None,
            status: RunStatus::Running,
            error: None,
        };
        if let Err(e) = self.store.record_run_start(&entry) {
            warn!(schedule_id = %schedule.id, error = %e, "could not record run start");
        }
        self.record_last_run(&schedule.id, &job_id, RunStatus::Running, started_at);
        info!(schedule_id = %schedule.id, job_id = %job_id, kind = %schedule.kind, "schedule run started");

        let outcome = run_job(
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            job_id.clone(),
            request,
        )
        .await;

        let status = RunStatus::from(outcome.status);
        let finished_at = Utc::now();
        if let Err(e) =
            self.store
                .record_run_complete(&job_id, status, outcome.error.as_deref(), finished_at)
        {
            warn!(schedule_id = %schedule.id, error = %e, "could not record run completion");
        }
        self.record_last_run(&schedule.id, &job_id, status, finished_at);
        info!(schedule_id = %schedule.id, job_id = %job_id, status = status.as_str(), "schedule run finished");

        if schedule.kind == ScheduleKind::Backup && status == RunStatus::Completed {
            if let Some(keep) = schedule.retention_count {
                apply_retention(&self.store, &self.backups, &schedule.id, keep as usize);
            }
        }
        self.refresh_next_run(&schedule.id);
        drop(guard);
        outcome
    }

    fn record_last_run(&self, schedule_id: &str, job_id: &str, status: RunStatus, at: DateTime<Utc>) {
        let last = LastRun {
            job_id: job_id.to_string(),
            status,
            at,
        };
        if let Err(e) = self.store.set_last_run(schedule_id, &last) {
            warn!(schedule_id, error = %e, "could not record last run");
        }
    }

    /// Recompute `next_run_at` for a registered schedule.
    fn refresh_next_run(&self, schedule_id: &str) {
        if !self.is_registered(schedule_id) {
            return;
        }
        let next = match self.store.get(schedule_id) {
            Ok(Some(schedule)) => match schedule.trigger.resolve() {
                Ok(expr) => expr.next_after(Utc::now(), self.timezone()),
                Err(_) => return,
            },
            _ => return,
        };
        if let Err(e) = self.store.set_next_run(schedule_id, next) {
            warn!(schedule_id, error = %e, "could not persist next run");
        }
    }

    /// Stop every timer, switch the scheduling timezone, persist it and
    /// register all enabled schedules again.
    #[instrument(skip(self))]
    pub fn reinitialize_with_timezone(&self, timezone: &str) -> Result<()> {
        let tz = parse_timezone(timezone)
            .ok_or_else(|| SchedulerError::InvalidTimezone(timezone.to_string()))?;

        {
            let mut timers = self.timers.lock().unwrap();
            for (_, token) in timers.drain() {
                token.cancel();
            }
        }
        *self.timezone.write().unwrap() = tz;
        self.store.set_setting(TIMEZONE_SETTING, tz.name())?;

        let mut registered = 0;
        for schedule in self.store.list()?.into_iter().filter(|s| s.enabled) {
            if self.schedule_job(&schedule).is_ok() {
                registered += 1;
            }
        }
        info!(%tz, registered, "scheduler reinitialized with new timezone");
        Ok(())
    }

    // ── Schedule surface ─────────────────────────────────────────────────────

    pub fn create_schedule(&self, draft: ScheduleDraft) -> Result<Schedule> {
        let (source_name, destination_name) = self.validate_draft(&draft)?;
        let now = Utc::now();
        let mut schedule = Schedule {
            id: new_id(),
            name: draft.name.trim().to_string(),
            kind: draft.kind,
            source_id: draft.source_id,
            source_name,
            destination_id: destination_name.as_ref().and(draft.destination_id),
            destination_name,
            categories: draft.categories,
            trigger: draft.trigger,
            enabled: draft.enabled,
            retention_count: draft.retention_count,
            last_run: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&schedule)?;
        if schedule.enabled {
            schedule.next_run_at = self.schedule_job(&schedule)?;
        }
        Ok(schedule)
    }

    pub fn update_schedule(&self, schedule_id: &str, draft: ScheduleDraft) -> Result<Schedule> {
        let existing = self.store.require(schedule_id)?;
        let (source_name, destination_name) = self.validate_draft(&draft)?;
        let mut schedule = Schedule {
            name: draft.name.trim().to_string(),
            kind: draft.kind,
            source_id: draft.source_id,
            source_name,
            destination_id: destination_name.as_ref().and(draft.destination_id),
            destination_name,
            categories: draft.categories,
            trigger: draft.trigger,
            enabled: draft.enabled,
            retention_count: draft.retention_count,
            next_run_at: None,
            updated_at: Utc::now(),
            ..existing
        };
        self.store.update(&schedule)?;
        if schedule.enabled {
            schedule.next_run_at = self.schedule_job(&schedule)?;
        } else {
            self.unschedule_job(schedule_id);
        }
        info!(schedule_id, "schedule updated");
        Ok(schedule)
    }

    /// Delete a schedule. Refused while a run holds its guard.
    pub fn delete_schedule(&self, schedule_id: &str) -> Result<()> {
        let running = self.running.lock().unwrap();
        if let Some(job_id) = running.get(schedule_id) {
            return Err(SchedulerError::AlreadyRunning {
                schedule_id: schedule_id.to_string(),
                job_id: job_id.clone(),
            });
        }
        self.store.delete(schedule_id)?;
        drop(running);
        self.unschedule_job(schedule_id);
        Ok(())
    }

    /// Flip `enabled`. Enabling registers a timer and recomputes
    /// `next_run_at`; disabling removes the timer and clears it.
    pub fn toggle(&self, schedule_id: &str) -> Result<Schedule> {
        let mut schedule = self.store.require(schedule_id)?;
        schedule.enabled = !schedule.enabled;
        schedule.updated_at = Utc::now();
        schedule.next_run_at = None;
        self.store.update(&schedule)?;

        if schedule.enabled {
            schedule.next_run_at = self.schedule_job(&schedule)?;
        } else {
            self.unschedule_job(schedule_id);
        }
        info!(schedule_id, enabled = schedule.enabled, "schedule toggled");
        Ok(schedule)
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Result<Schedule> {
        self.store.require(schedule_id)
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        self.store.list()
    }

    /// Most recent runs first.
    pub fn get_history(&self, schedule_id: &str, limit: usize) -> Result<Vec<RunHistoryEntry>> {
        self.store.require(schedule_id)?;
        self.store.history(schedule_id, limit)
    }

    /// Parse `expression` and preview its next fire times in the current
    /// scheduling timezone.
    pub fn validate_expression(&self, expression: &str) -> Result<Vec<DateTime<Utc>>> {
        let expr = CronExpr::parse(expression).map_err(|source| SchedulerError::InvalidExpression {
            expression: expression.to_string(),
            source,
        })?;
        Ok(expr.upcoming(Utc::now(), self.timezone(), PREVIEW_RUNS))
    }

    /// Check a draft and resolve the display names of its connections.
    fn validate_draft(&self, draft: &ScheduleDraft) -> Result<(String, Option<String>)> {
        if draft.name.trim().is_empty() {
            return Err(SchedulerError::Validation("name must not be empty".into()));
        }
        if draft.categories.is_empty() {
            return Err(SchedulerError::Validation("select at least one category".into()));
        }
        if draft.retention_count == Some(0) {
            return Err(SchedulerError::Validation("retention_count must be at least 1".into()));
        }
        draft
            .trigger
            .resolve()
            .map_err(|source| SchedulerError::InvalidExpression {
                expression: draft.trigger.expression().to_string(),
                source,
            })?;

        let source = self
            .connections
            .get(&draft.source_id)?
            .ok_or_else(|| SchedulerError::not_found("connection", &draft.source_id))?;

        let destination_name = match draft.kind {
            ScheduleKind::Backup => None,
            ScheduleKind::Sync => {
                let id = draft.destination_id.as_deref().ok_or_else(|| {
                    SchedulerError::Validation("sync schedules need a destination".into())
                })?;
                if id == draft.source_id {
                    return Err(SchedulerError::Validation(
                        "source and destination must differ".into(),
                    ));
                }
                let destination = self
                    .connections
                    .get(id)?
                    .ok_or_else(|| SchedulerError::not_found("connection", id))?;
                Some(destination.name)
            }
        };
        Ok((source.name, destination_name))
    }
}

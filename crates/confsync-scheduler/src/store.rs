use std::sync::Mutex;

use chrono::{DateTime, Utc};
use confsync_core::config::SCHEDULE_HISTORY_LIMIT;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use crate::db::{self, parse_ts, text_err, ts};
use crate::error::{Result, SchedulerError};
use crate::types::{LastRun, RunHistoryEntry, RunStatus, Schedule};

const SELECT_SCHEDULE: &str = "SELECT id, name, kind, source_id, source_name, destination_id,
        destination_name, categories, trigger_spec, enabled, retention_count, last_run,
        next_run_at, created_at, updated_at
    FROM schedules";

const SELECT_RUN: &str =
    "SELECT id, schedule_id, job_id, started_at, completed_at, status, error FROM schedule_runs";

/// Durable CRUD for schedules, their run history and scheduler settings.
pub struct ScheduleStore {
    conn: Mutex<Connection>,
    history_limit: usize,
}

impl ScheduleStore {
    pub fn new(conn: Connection) -> Result<Self> {
        Self::with_history_limit(conn, SCHEDULE_HISTORY_LIMIT)
    }

    pub fn with_history_limit(conn: Connection, history_limit: usize) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            history_limit: history_limit.max(1),
        })
    }

    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id))]
    pub fn insert(&self, schedule: &Schedule) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedules
             (id, name, kind, source_id, source_name, destination_id, destination_name,
              categories, trigger_spec, enabled, retention_count, last_run, next_run_at,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                schedule.id,
                schedule.name,
                schedule.kind.as_str(),
                schedule.source_id,
                schedule.source_name,
                schedule.destination_id,
                schedule.destination_name,
                serde_json::to_string(&schedule.categories)?,
                serde_json::to_string(&schedule.trigger)?,
                schedule.enabled,
                schedule.retention_count,
                schedule.last_run.as_ref().map(serde_json::to_string).transpose()?,
                schedule.next_run_at.as_ref().map(ts),
                ts(&schedule.created_at),
                ts(&schedule.updated_at),
            ],
        )?;
        info!(name = %schedule.name, "schedule created");
        Ok(())
    }

    /// Persist every editable field of `schedule`.
    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id))]
    pub fn update(&self, schedule: &Schedule) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE schedules SET
                name = ?2, kind = ?3, source_id = ?4, source_name = ?5, destination_id = ?6,
                destination_name = ?7, categories = ?8, trigger_spec = ?9, enabled = ?10,
                retention_count = ?11, next_run_at = ?12, updated_at = ?13
             WHERE id = ?1",
            params![
                schedule.id,
                schedule.name,
                schedule.kind.as_str(),
                schedule.source_id,
                schedule.source_name,
                schedule.destination_id,
                schedule.destination_name,
                serde_json::to_string(&schedule.categories)?,
                serde_json::to_string(&schedule.trigger)?,
                schedule.enabled,
                schedule.retention_count,
                schedule.next_run_at.as_ref().map(ts),
                ts(&schedule.updated_at),
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::not_found("schedule", &schedule.id));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let schedule = conn
            .query_row(&format!("{SELECT_SCHEDULE} WHERE id = ?1"), [id], row_to_schedule)
            .optional()?;
        Ok(schedule)
    }

    pub fn require(&self, id: &str) -> Result<Schedule> {
        self.get(id)?
            .ok_or_else(|| SchedulerError::not_found("schedule", id))
    }

    /// All schedules ordered by name.
    pub fn list(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{SELECT_SCHEDULE} ORDER BY name, created_at"))?;
        let rows = stmt.query_map([], row_to_schedule)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete a schedule together with its run history.
    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::not_found("schedule", id));
        }
        conn.execute("DELETE FROM schedule_runs WHERE schedule_id = ?1", [id])?;
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    pub fn set_next_run(&self, id: &str, next: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedules SET next_run_at = ?2 WHERE id = ?1",
            params![id, next.as_ref().map(ts)],
        )?;
        Ok(())
    }

    pub fn set_last_run(&self, id: &str, last: &LastRun) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedules SET last_run = ?2 WHERE id = ?1",
            params![id, serde_json::to_string(last)?],
        )?;
        Ok(())
    }

    /// Append a history entry and trim the schedule's history to the limit,
    /// oldest first.
    pub fn record_run_start(&self, entry: &RunHistoryEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedule_runs (id, schedule_id, job_id, started_at, completed_at, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.schedule_id,
                entry.job_id,
                ts(&entry.started_at),
                entry.completed_at.as_ref().map(ts),
                entry.status.as_str(),
                entry.error,
            ],
        )?;
        let trimmed = conn.execute(
            "DELETE FROM schedule_runs WHERE schedule_id = ?1 AND seq NOT IN
                (SELECT seq FROM schedule_runs WHERE schedule_id = ?1 ORDER BY seq DESC LIMIT ?2)",
            params![entry.schedule_id, self.history_limit as i64],
        )?;
        if trimmed > 0 {
            debug!(schedule_id = %entry.schedule_id, trimmed, "run history trimmed");
        }
        Ok(())
    }

    pub fn record_run_complete(
        &self,
        job_id: &str,
        status: RunStatus,
        error: Option<&str>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedule_runs SET status = ?2, error = ?3, completed_at = ?4 WHERE job_id = ?1",
            params![job_id, status.as_str(), error, ts(&completed_at)],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn history(&self, schedule_id: &str, limit: usize) -> Result<Vec<RunHistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_RUN} WHERE schedule_id = ?1 ORDER BY seq DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![schedule_id, limit as i64], row_to_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Remove the history entries of `job_ids` (used by retention).
    pub fn delete_runs_for_jobs(&self, schedule_id: &str, job_ids: &[String]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare_cached("DELETE FROM schedule_runs WHERE schedule_id = ?1 AND job_id = ?2")?;
        let mut removed = 0;
        for job_id in job_ids {
            removed += stmt.execute(params![schedule_id, job_id])?;
        }
        Ok(removed)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Schedule> {
    let kind: String = row.get(2)?;
    let categories: String = row.get(7)?;
    let trigger: String = row.get(8)?;
    let last_run: Option<String> = row.get(11)?;
    let next_run_at: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: kind.parse().map_err(text_err)?,
        source_id: row.get(3)?,
        source_name: row.get(4)?,
        destination_id: row.get(5)?,
        destination_name: row.get(6)?,
        categories: serde_json::from_str(&categories).map_err(|e| text_err(e.to_string()))?,
        trigger: serde_json::from_str(&trigger).map_err(|e| text_err(e.to_string()))?,
        enabled: row.get(9)?,
        retention_count: row.get(10)?,
        last_run: last_run
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| text_err(e.to_string()))?,
        next_run_at: next_run_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunHistoryEntry> {
    let started_at: String = row.get(3)?;
    let completed_at: Option<String> = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(RunHistoryEntry {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        job_id: row.get(2)?,
        started_at: parse_ts(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        status: status.parse().map_err(text_err)?,
        error: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Preset, ScheduleKind, Trigger};
    use confsync_core::{new_id, CategorySet};

    fn schedule(name: &str) -> Schedule {
        let now = Utc::now();
        Schedule {
            id: new_id(),
            name: name.to_string(),
            kind: ScheduleKind::Backup,
            source_id: "c1".to_string(),
            source_name: "primary".to_string(),
            destination_id: None,
            destination_name: None,
            categories: CategorySet::all(),
            trigger: Trigger::Preset { preset: Preset::Daily },
            enabled: true,
            retention_count: Some(3),
            last_run: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn run(schedule_id: &str, job_id: &str) -> RunHistoryEntry {
        RunHistoryEntry {
            id: new_id(),
            schedule_id: schedule_id.to_string(),
            job_id: job_id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            error: None,
        }
    }

    #[test]
    fn schedule_round_trips_through_sqlite() {
        let store = ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let s = schedule("nightly");
        store.insert(&s).unwrap();

        let last = LastRun {
            job_id: "j1".to_string(),
            status: RunStatus::Completed,
            at: Utc::now(),
        };
        store.set_last_run(&s.id, &last).unwrap();
        let next = Utc::now();
        store.set_next_run(&s.id, Some(next)).unwrap();

        let got = store.require(&s.id).unwrap();
        assert_eq!(got.name, "nightly");
        assert_eq!(got.trigger, s.trigger);
        assert_eq!(got.categories, CategorySet::all());
        assert_eq!(got.retention_count, Some(3));
        assert_eq!(got.last_run, Some(last));
        assert_eq!(got.next_run_at, Some(next));

        store.delete(&s.id).unwrap();
        assert!(store.get(&s.id).unwrap().is_none());
        assert!(matches!(store.delete(&s.id), Err(SchedulerError::NotFound { .. })));
    }

    #[test]
    fn history_is_bounded_per_schedule_and_newest_first() {
        let store =
            ScheduleStore::with_history_limit(Connection::open_in_memory().unwrap(), 3).unwrap();
        for i in 0..5 {
            store.record_run_start(&run("a", &format!("a{i}"))).unwrap();
        }
        store.record_run_start(&run("b", "b0")).unwrap();

        let jobs: Vec<String> = store.history("a", 10).unwrap().into_iter().map(|r| r.job_id).collect();
        assert_eq!(jobs, vec!["a4", "a3", "a2"]);
        assert_eq!(store.history("b", 10).unwrap().len(), 1);
        assert_eq!(store.history("a", 1).unwrap().len(), 1);
    }

    #[test]
    fn run_completion_updates_the_entry() {
        let store = ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        store.record_run_start(&run("a", "j1")).unwrap();
        store
            .record_run_complete("j1", RunStatus::Failed, Some("boom"), Utc::now())
            .unwrap();
        let entry = &store.history("a", 1).unwrap()[0];
        assert_eq!(entry.status, RunStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("boom"));
        assert!(entry.completed_at.is_some());
    }

    #[test]
    fn settings_upsert() {
        let store = ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        assert_eq!(store.get_setting("timezone").unwrap(), None);
        store.set_setting("timezone", "UTC").unwrap();
        store.set_setting("timezone", "Europe/Berlin").unwrap();
        assert_eq!(store.get_setting("timezone").unwrap().as_deref(), Some("Europe/Berlin"));
    }
}

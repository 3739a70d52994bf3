use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::types::{Job, LogEntry};

/// Initialise the job tables.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id            TEXT PRIMARY KEY,
            kind          TEXT NOT NULL,
            status        TEXT NOT NULL,
            progress      INTEGER NOT NULL DEFAULT 0,
            message       TEXT,
            result        TEXT,               -- JSON summary or NULL
            error         TEXT,
            created_at    TEXT NOT NULL,
            started_at    TEXT,
            completed_at  TEXT,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS job_logs (
            job_id     TEXT NOT NULL,
            seq        INTEGER NOT NULL,
            logged_at  TEXT NOT NULL,
            message    TEXT NOT NULL,
            PRIMARY KEY (job_id, seq)
        );

        -- Terminal snapshots. Re-inserting a job_id replaces its row and
        -- moves it to the newest position (seq is reassigned).
        CREATE TABLE IF NOT EXISTS job_history (
            seq           INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id        TEXT NOT NULL UNIQUE,
            snapshot      TEXT NOT NULL,
            completed_at  TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

pub(crate) fn upsert_job(conn: &Connection, job: &Job) -> Result<()> {
    let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO jobs
         (id, kind, status, progress, message, result, error,
          created_at, started_at, completed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            job.id,
            job.kind.as_str(),
            job.status.as_str(),
            job.progress,
            job.message,
            result,
            job.error,
            ts(&job.created_at),
            job.started_at.as_ref().map(ts),
            job.completed_at.as_ref().map(ts),
            ts(&job.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn load_jobs(conn: &Connection) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, status, progress, message, result, error,
                created_at, started_at, completed_at, updated_at
         FROM jobs ORDER BY created_at",
    )?;
    let rows = stmt.query_map([], row_to_job)?;
    let mut jobs = Vec::new();
    for row in rows {
        match row {
            Ok(job) => jobs.push(job),
            Err(e) => tracing::warn!(error = %e, "skipping unreadable job row"),
        }
    }
    Ok(jobs)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let text_err = |e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.into(),
        )
    };
    let kind: String = row.get(1)?;
    let status: String = row.get(2)?;
    let result: Option<String> = row.get(5)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(10)?;

    Ok(Job {
        id: row.get(0)?,
        kind: kind.parse().map_err(text_err)?,
        status: status.parse().map_err(text_err)?,
        progress: row.get(3)?,
        message: row.get(4)?,
        result: result
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(|e| text_err(e.to_string()))?,
        error: row.get(6)?,
        created_at: parse_ts(&created_at)?,
        started_at: parse_opt_ts(row.get(8)?)?,
        completed_at: parse_opt_ts(row.get(9)?)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

pub(crate) fn delete_job(conn: &Connection, id: &str) -> Result<()> {
    conn.execute("DELETE FROM job_logs WHERE job_id = ?1", [id])?;
    conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
    Ok(())
}

pub(crate) fn insert_logs(conn: &Connection, job_id: &str, first_seq: usize, entries: &[LogEntry]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR REPLACE INTO job_logs (job_id, seq, logged_at, message)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (offset, entry) in entries.iter().enumerate() {
        stmt.execute(params![
            job_id,
            (first_seq + offset) as i64,
            ts(&entry.timestamp),
            entry.message
        ])?;
    }
    Ok(())
}

pub(crate) fn load_logs(conn: &Connection, job_id: &str) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT logged_at, message FROM job_logs WHERE job_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map([job_id], |row| {
        let at: String = row.get(0)?;
        Ok(LogEntry {
            timestamp: parse_ts(&at)?,
            message: row.get(1)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Write (or replace) the snapshot for `job` and trim history to `limit`.
pub(crate) fn record_snapshot(conn: &Connection, job: &Job, limit: usize) -> Result<()> {
    let snapshot = serde_json::to_string(job)?;
    let completed_at = job.completed_at.as_ref().unwrap_or(&job.updated_at);
    conn.execute("DELETE FROM job_history WHERE job_id = ?1", [&job.id])?;
    conn.execute(
        "INSERT INTO job_history (job_id, snapshot, completed_at) VALUES (?1, ?2, ?3)",
        params![job.id, snapshot, ts(completed_at)],
    )?;
    conn.execute(
        "DELETE FROM job_history WHERE seq NOT IN
            (SELECT seq FROM job_history ORDER BY seq DESC LIMIT ?1)",
        [limit as i64],
    )?;
    Ok(())
}

/// History snapshots, oldest first.
pub(crate) fn load_history(conn: &Connection) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare("SELECT snapshot FROM job_history ORDER BY seq")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut history = Vec::new();
    for raw in rows.filter_map(|r| r.ok()) {
        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => history.push(job),
            Err(e) => tracing::warn!(error = %e, "skipping unreadable history snapshot"),
        }
    }
    Ok(history)
}

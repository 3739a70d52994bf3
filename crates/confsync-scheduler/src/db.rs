use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `schedules`, `schedule_runs` and `settings` tables
/// (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id                TEXT    NOT NULL PRIMARY KEY,
            name              TEXT    NOT NULL,
            kind              TEXT    NOT NULL,
            source_id         TEXT    NOT NULL,
            source_name       TEXT    NOT NULL,
            destination_id    TEXT,
            destination_name  TEXT,
            categories        TEXT    NOT NULL,   -- JSON array of category tags
            trigger_spec      TEXT    NOT NULL,   -- JSON-encoded Trigger
            enabled           INTEGER NOT NULL DEFAULT 1,
            retention_count   INTEGER,            -- NULL keeps everything
            last_run          TEXT,               -- JSON-encoded LastRun or NULL
            next_run_at       TEXT,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS schedule_runs (
            seq           INTEGER PRIMARY KEY AUTOINCREMENT,
            id            TEXT    NOT NULL UNIQUE,
            schedule_id   TEXT    NOT NULL,
            job_id        TEXT    NOT NULL,
            started_at    TEXT    NOT NULL,
            completed_at  TEXT,
            status        TEXT    NOT NULL,
            error         TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedule_runs_schedule
            ON schedule_runs (schedule_id, seq);

        CREATE TABLE IF NOT EXISTS settings (
            key    TEXT NOT NULL PRIMARY KEY,
            value  TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn text_err(msg: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into().into())
}

use rusqlite::Connection;

use crate::error::Result;

/// Initialise the connection-profile and backup-catalog tables.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS connections (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            base_url    TEXT NOT NULL,
            username    TEXT NOT NULL,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS backups (
            id             TEXT PRIMARY KEY,
            job_id         TEXT NOT NULL,
            schedule_id    TEXT,               -- NULL for manual backups
            connection_id  TEXT NOT NULL,
            filename       TEXT NOT NULL,
            size_bytes     INTEGER NOT NULL,
            sha256         TEXT NOT NULL,
            categories     TEXT NOT NULL,      -- JSON array
            created_at     TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_backups_schedule
            ON backups(schedule_id, created_at);
        ",
    )?;
    Ok(())
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

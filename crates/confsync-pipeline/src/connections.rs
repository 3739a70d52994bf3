use std::sync::Mutex;

use chrono::{DateTime, Utc};
use confsync_core::new_id;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::db::{self, parse_ts};
use crate::error::{PipelineError, Result};

/// A stored remote instance: where it lives and how to log in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub username: String,
    /// Never echoed back over the API.
    #[serde(skip_serializing, default)]
    pub password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating or replacing a profile.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDraft {
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl ConnectionDraft {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Validation("connection name must not be empty".into()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(PipelineError::Validation(format!(
                "base_url must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        if self.username.trim().is_empty() {
            return Err(PipelineError::Validation("username must not be empty".into()));
        }
        Ok(())
    }
}

/// SQLite-backed CRUD over connection profiles.
pub struct ConnectionStore {
    db: Mutex<Connection>,
}

impl ConnectionStore {
    pub fn new(conn: Connection) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }

    #[instrument(skip(self, draft), fields(name = %draft.name))]
    pub fn create(&self, draft: ConnectionDraft) -> Result<ConnectionProfile> {
        draft.validate()?;
        let now = Utc::now();
        let profile = ConnectionProfile {
            id: new_id(),
            name: draft.name.trim().to_string(),
            base_url: draft.base_url.trim_end_matches('/').to_string(),
            username: draft.username,
            password: draft.password,
            created_at: now,
            updated_at: now,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO connections (id, name, base_url, username, password, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                profile.id,
                profile.name,
                profile.base_url,
                profile.username,
                profile.password,
                profile.created_at.to_rfc3339(),
                profile.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| unique_violation(e, &profile.name))?;
        info!(connection_id = %profile.id, "connection created");
        Ok(profile)
    }

    pub fn get(&self, id: &str) -> Result<Option<ConnectionProfile>> {
        let db = self.db.lock().unwrap();
        let profile = db
            .query_row(
                "SELECT id, name, base_url, username, password, created_at, updated_at
                 FROM connections WHERE id = ?1",
                [id],
                row_to_profile,
            )
            .optional()?;
        Ok(profile)
    }

    /// Like [`get`](Self::get) but a missing profile is an error.
    pub fn require(&self, id: &str) -> Result<ConnectionProfile> {
        self.get(id)?.ok_or_else(|| PipelineError::NotFound {
            what: "connection",
            id: id.to_string(),
        })
    }

    pub fn list(&self) -> Result<Vec<ConnectionProfile>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, name, base_url, username, password, created_at, updated_at
             FROM connections ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_profile)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[instrument(skip(self, draft))]
    pub fn update(&self, id: &str, draft: ConnectionDraft) -> Result<ConnectionProfile> {
        draft.validate()?;
        let mut profile = self.require(id)?;
        profile.name = draft.name.trim().to_string();
        profile.base_url = draft.base_url.trim_end_matches('/').to_string();
        profile.username = draft.username;
        // An empty password keeps the stored one.
        if !draft.password.is_empty() {
            profile.password = draft.password;
        }
        profile.updated_at = Utc::now();

        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE connections
             SET name = ?2, base_url = ?3, username = ?4, password = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                profile.id,
                profile.name,
                profile.base_url,
                profile.username,
                profile.password,
                profile.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| unique_violation(e, &profile.name))?;
        info!(connection_id = %id, "connection updated");
        Ok(profile)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM connections WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(PipelineError::NotFound {
                what: "connection",
                id: id.to_string(),
            });
        }
        info!(connection_id = %id, "connection deleted");
        Ok(())
    }
}

fn unique_violation(e: rusqlite::Error, name: &str) -> PipelineError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            PipelineError::Validation(format!("a connection named '{name}' already exists"))
        }
        other => PipelineError::Database(other),
    }
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionProfile> {
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(ConnectionProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        username: row.get(3)?,
        password: row.get(4)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConnectionStore {
        ConnectionStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn draft(name: &str) -> ConnectionDraft {
        ConnectionDraft {
            name: name.to_string(),
            base_url: "http://tv.local:9191/".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test]
    fn create_get_list_delete() {
        let store = store();
        let a = store.create(draft("primary")).unwrap();
        store.create(draft("backup")).unwrap();

        assert_eq!(a.base_url, "http://tv.local:9191");
        let got = store.get(&a.id).unwrap().unwrap();
        assert_eq!(got.password, "secret");

        let names: Vec<String> = store.list().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["backup", "primary"]);

        store.delete(&a.id).unwrap();
        assert!(store.get(&a.id).unwrap().is_none());
        assert!(matches!(store.delete(&a.id), Err(PipelineError::NotFound { .. })));
    }

    #[test]
    fn empty_password_on_update_keeps_old_one() {
        let store = store();
        let a = store.create(draft("primary")).unwrap();
        let mut changed = draft("primary");
        changed.password = String::new();
        changed.base_url = "https://tv.example.com".to_string();
        let updated = store.update(&a.id, changed).unwrap();
        assert_eq!(updated.password, "secret");
        assert_eq!(updated.base_url, "https://tv.example.com");
    }

    #[test]
    fn duplicate_names_and_bad_urls_are_rejected() {
        let store = store();
        store.create(draft("primary")).unwrap();
        assert!(matches!(store.create(draft("primary")), Err(PipelineError::Validation(_))));

        let mut bad = draft("other");
        bad.base_url = "tv.local".to_string();
        assert!(matches!(store.create(bad), Err(PipelineError::Validation(_))));
    }

    #[test]
    fn password_is_not_serialized() {
        let store = store();
        let a = store.create(draft("primary")).unwrap();
        let json = serde_json::to_value(&a).unwrap();
        assert!(json.get("password").is_none());
        assert_eq!(json["name"], "primary");
    }
}

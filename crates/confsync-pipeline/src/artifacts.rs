use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use confsync_core::CategorySet;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::db::{self, parse_ts};
use crate::error::{PipelineError, Result};

/// Per-job scratch directories under `<data>/work/<job_id>/`.
///
/// Removal takes the entry out of the map before touching the filesystem,
/// so concurrent cleanups (explicit delete racing a finished download)
/// delete each directory exactly once.
pub struct WorkDirs {
    root: PathBuf,
    dirs: DashMap<String, WorkDir>,
}

#[derive(Debug, Clone)]
struct WorkDir {
    path: PathBuf,
    archive: Option<PathBuf>,
}

impl WorkDirs {
    /// Anything left under `root` belongs to a previous process and is
    /// removed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if root.exists() {
            for entry in std::fs::read_dir(&root)? {
                let path = entry?.path();
                if let Err(e) = remove_path(&path) {
                    warn!(path = %path.display(), error = %e, "could not remove stale work dir");
                }
            }
        }
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            dirs: DashMap::new(),
        })
    }

    pub fn create(&self, job_id: &str) -> io::Result<PathBuf> {
        let path = self.root.join(job_id);
        std::fs::create_dir_all(&path)?;
        self.dirs.insert(
            job_id.to_string(),
            WorkDir {
                path: path.clone(),
                archive: None,
            },
        );
        debug!(job_id, path = %path.display(), "work dir created");
        Ok(path)
    }

    /// Remember the downloadable archive produced inside a job's work dir.
    pub fn set_archive(&self, job_id: &str, archive: PathBuf) {
        if let Some(mut dir) = self.dirs.get_mut(job_id) {
            dir.archive = Some(archive);
        }
    }

    pub fn archive(&self, job_id: &str) -> Option<PathBuf> {
        self.dirs.get(job_id).and_then(|d| d.archive.clone())
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.dirs.contains_key(job_id)
    }

    /// Delete the job's work dir. Returns `true` only for the call that
    /// actually removed it.
    pub fn cleanup(&self, job_id: &str) -> bool {
        let Some((_, dir)) = self.dirs.remove(job_id) else {
            return false;
        };
        if let Err(e) = remove_path(&dir.path) {
            warn!(job_id, path = %dir.path.display(), error = %e, "work dir cleanup failed");
        } else {
            debug!(job_id, "work dir removed");
        }
        true
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Zip every file under `src` (recursively) into `dest`.
pub fn write_archive(src: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut stack = vec![src.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<io::Result<_>>()?;
        entries.sort();
        for path in entries {
            if path == dest {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let name = path
                .strip_prefix(src)
                .map_err(|e| PipelineError::Archive(e.to_string()))?
                .to_string_lossy()
                .replace('\\', "/");
            zip.start_file(name, options)?;
            let mut buf = Vec::new();
            File::open(&path)?.read_to_end(&mut buf)?;
            zip.write_all(&buf)?;
        }
    }
    zip.finish()?;
    Ok(())
}

/// Unpack `archive` into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    zip.extract(dest)?;
    Ok(())
}

/// Hex-encoded SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// A backup archive kept on disk under the backups directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub job_id: String,
    pub schedule_id: Option<String>,
    pub connection_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub categories: CategorySet,
    pub created_at: DateTime<Utc>,
}

/// Catalog of persisted backup archives.
pub struct BackupStore {
    db: Mutex<Connection>,
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(conn: Connection, dir: impl Into<PathBuf>) -> Result<Self> {
        db::init_db(&conn)?;
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            db: Mutex::new(conn),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, record: &BackupRecord) -> PathBuf {
        self.dir.join(&record.filename)
    }

    pub fn insert(&self, record: &BackupRecord) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO backups
             (id, job_id, schedule_id, connection_id, filename, size_bytes, sha256, categories, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.job_id,
                record.schedule_id,
                record.connection_id,
                record.filename,
                record.size_bytes as i64,
                record.sha256,
                serde_json::to_string(&record.categories)?,
                record.created_at.to_rfc3339(),
            ],
        )?;
        info!(backup_id = %record.id, filename = %record.filename, "backup recorded");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<BackupRecord>> {
        let db = self.db.lock().unwrap();
        let record = db
            .query_row(
                &format!("{SELECT} WHERE id = ?1"),
                [id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// All backups, newest first.
    pub fn list(&self) -> Result<Vec<BackupRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!("{SELECT} ORDER BY created_at DESC, rowid DESC"))?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Backups produced by one schedule, newest first.
    pub fn list_for_schedule(&self, schedule_id: &str) -> Result<Vec<BackupRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "{SELECT} WHERE schedule_id = ?1 ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map([schedule_id], row_to_record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Remove the catalog row and its archive. A missing file is not an
    /// error; the row is removed either way.
    pub fn delete(&self, id: &str) -> Result<BackupRecord> {
        let record = self.get(id)?.ok_or_else(|| PipelineError::NotFound {
            what: "backup",
            id: id.to_string(),
        })?;
        let path = self.path_of(&record);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "backup file already gone")
            }
            Err(e) => return Err(e.into()),
        }
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM backups WHERE id = ?1", [id])?;
        info!(backup_id = %id, "backup deleted");
        Ok(record)
    }
}

const SELECT: &str = "SELECT id, job_id, schedule_id, connection_id, filename, size_bytes, sha256, categories, created_at FROM backups";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupRecord> {
    let categories: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let size: i64 = row.get(5)?;
    Ok(BackupRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        schedule_id: row.get(2)?,
        connection_id: row.get(3)?,
        filename: row.get(4)?,
        size_bytes: size as u64,
        sha256: row.get(6)?,
        categories: serde_json::from_str(&categories).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use confsync_core::Category;
    use std::sync::Arc;

    #[test]
    fn cleanup_happens_exactly_once_under_races() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = Arc::new(WorkDirs::new(tmp.path().join("work")).unwrap());
        let path = dirs.create("job-1").unwrap();
        std::fs::write(path.join("users.json"), "[]").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dirs = Arc::clone(&dirs);
                std::thread::spawn(move || dirs.cleanup("job-1"))
            })
            .collect();
        let removed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r)
            .count();

        assert_eq!(removed, 1);
        assert!(!path.exists());
        assert!(!dirs.contains("job-1"));
    }

    #[test]
    fn stale_work_dirs_are_purged_on_startup() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("work");
        std::fs::create_dir_all(root.join("old-job")).unwrap();
        WorkDirs::new(&root).unwrap();
        assert!(!root.join("old-job").exists());
        assert!(root.exists());
    }

    #[test]
    fn archive_round_trip_keeps_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("logos")).unwrap();
        std::fs::write(src.join("manifest.json"), "{}").unwrap();
        std::fs::write(src.join("logos/1.png"), [1u8, 2, 3]).unwrap();

        let archive = tmp.path().join("out.zip");
        write_archive(&src, &archive).unwrap();
        let out = tmp.path().join("out");
        extract_archive(&archive, &out).unwrap();

        assert_eq!(std::fs::read(out.join("logos/1.png")).unwrap(), vec![1, 2, 3]);
        assert_eq!(sha256_file(&archive).unwrap().len(), 64);
    }

    fn record(id: &str, schedule: Option<&str>, minutes_ago: i64) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            job_id: format!("job-{id}"),
            schedule_id: schedule.map(str::to_string),
            connection_id: "c1".to_string(),
            filename: format!("{id}.zip"),
            size_bytes: 3,
            sha256: "00".repeat(32),
            categories: [Category::Users].into_iter().collect(),
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn catalog_lists_newest_first_and_deletes_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackupStore::new(Connection::open_in_memory().unwrap(), tmp.path()).unwrap();
        for (id, age) in [("a", 30), ("b", 20), ("c", 10)] {
            let rec = record(id, Some("s1"), age);
            std::fs::write(store.path_of(&rec), "zip").unwrap();
            store.insert(&rec).unwrap();
        }
        store.insert(&record("m", None, 5)).unwrap();

        let ids: Vec<String> = store
            .list_for_schedule("s1")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert_eq!(store.list().unwrap().len(), 4);

        let gone = store.delete("a").unwrap();
        assert!(!store.path_of(&gone).exists());
        assert!(store.get("a").unwrap().is_none());
        // No file on disk for "m"; the row still goes.
        store.delete("m").unwrap();
        assert!(matches!(store.delete("m"), Err(PipelineError::NotFound { .. })));
    }
}

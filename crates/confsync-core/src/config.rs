use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 9191;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const JOB_RETENTION_SECS: u64 = 60 * 60; // completed jobs leave the active map after 1h
pub const JOB_HISTORY_LIMIT: usize = 100;
pub const SCHEDULE_HISTORY_LIMIT: usize = 100;
pub const LOG_FLUSH_EVERY: usize = 10;
pub const REMOTE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Top-level config (confsync.toml + CONFSYNC_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfsyncConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Where the SQLite file, job work dirs and backup archives live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("confsync.db")
    }

    /// Root for job-scoped scratch directories.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }

    /// Persisted backup archives produced by scheduled runs.
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone used for cron evaluation until changed at runtime.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// How long a finished job stays in the active map.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_log_flush_every")]
    pub log_flush_every: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            history_limit: default_history_limit(),
            sweep_interval_secs: default_sweep_interval(),
            log_flush_every: default_log_flush_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_retention_secs() -> u64 {
    JOB_RETENTION_SECS
}
fn default_history_limit() -> usize {
    JOB_HISTORY_LIMIT
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_log_flush_every() -> usize {
    LOG_FLUSH_EVERY
}
fn default_timeout_secs() -> u64 {
    REMOTE_TIMEOUT_SECS
}
fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}
fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".confsync")
}

impl ConfsyncConfig {
    /// Load config from a TOML file with CONFSYNC_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CONFSYNC_STORAGE__DATA_DIR=/var/lib/confsync`.
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConfsyncConfig = Figment::from(Serialized::defaults(ConfsyncConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONFSYNC_").split("__"))
            .extract()
            .map_err(|e| crate::error::ConfsyncError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.confsync/confsync.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ConfsyncConfig::load(Some("/nonexistent/confsync.toml")).unwrap();
        assert_eq!(cfg.server.port, DEFAULT_PORT);
        assert_eq!(cfg.jobs.history_limit, JOB_HISTORY_LIMIT);
        assert_eq!(cfg.scheduler.timezone, "UTC");
    }

    #[test]
    fn toml_overrides_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[scheduler]\ntimezone = \"Europe/Rome\"\n\n[remote]\npage_size = 25\n\n[storage]\ndata_dir = \"/tmp/cs\""
        )
        .unwrap();

        let cfg = ConfsyncConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.scheduler.timezone, "Europe/Rome");
        assert_eq!(cfg.remote.page_size, 25);
        assert_eq!(cfg.remote.timeout_secs, REMOTE_TIMEOUT_SECS);
        assert_eq!(cfg.storage.db_path(), PathBuf::from("/tmp/cs/confsync.db"));
    }
}

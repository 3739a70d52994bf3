use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use confsync_core::config::ConfsyncConfig;
use confsync_jobs::{JobRegistry, RegistrySettings};
use confsync_pipeline::{
    BackupStore, ClientFactory, ConnectionStore, HttpClientFactory, Pipeline, TaskExecutor,
    WorkDirs,
};
use confsync_scheduler::{ScheduleStore, Scheduler};
use rusqlite::Connection;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::http;

/// Central shared state: passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub connections: Arc<ConnectionStore>,
    pub backups: Arc<BackupStore>,
    pub work_dirs: Arc<WorkDirs>,
    pub executor: Arc<dyn TaskExecutor>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// Open every subsystem against the configured data directory, talking
    /// to remotes over HTTP.
    pub fn open(config: ConfsyncConfig) -> anyhow::Result<Self> {
        let clients = Arc::new(HttpClientFactory::new(Duration::from_secs(
            config.remote.timeout_secs,
        )));
        Self::with_clients(config, clients)
    }

    /// Like [`open`](Self::open) with a caller-supplied client factory.
    pub fn with_clients(
        config: ConfsyncConfig,
        clients: Arc<dyn ClientFactory>,
    ) -> anyhow::Result<Self> {
        let storage = &config.storage;
        std::fs::create_dir_all(&storage.data_dir)?;
        let db_path = storage.db_path();
        info!(path = %db_path.display(), "opening SQLite database");

        // each subsystem gets its own connection; all share one file
        let registry = Arc::new(JobRegistry::open(
            open_db(&db_path)?,
            RegistrySettings::from(&config.jobs),
        )?);
        let connections = Arc::new(ConnectionStore::new(open_db(&db_path)?)?);
        let backups = Arc::new(BackupStore::new(open_db(&db_path)?, storage.backups_dir())?);
        let schedules = Arc::new(ScheduleStore::new(open_db(&db_path)?)?);
        let work_dirs = Arc::new(WorkDirs::new(storage.work_dir())?);
        info!("database migrations complete");

        let executor: Arc<dyn TaskExecutor> = Arc::new(Pipeline::new(
            clients,
            Arc::clone(&work_dirs),
            Arc::clone(&backups),
            config.remote.page_size,
        ));
        let scheduler = Arc::new(Scheduler::new(
            schedules,
            Arc::clone(&connections),
            Arc::clone(&registry),
            Arc::clone(&executor),
            Arc::clone(&backups),
            &config.scheduler.timezone,
        )?);

        Ok(Self {
            registry,
            connections,
            backups,
            work_dirs,
            executor,
            scheduler,
        })
    }

    /// Sweep expired jobs every `interval`. Work dirs of evicted jobs (an
    /// archive nobody downloaded) are deleted along with them.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let work_dirs = Arc::clone(&self.work_dirs);
        Arc::clone(&self.registry).spawn_sweeper(interval, shutdown, move |swept| {
            for id in swept {
                if work_dirs.cleanup(id) {
                    info!(job_id = %id, "released work dir of expired job");
                }
            }
        })
    }
}

fn open_db(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(http::health::health_handler))
        // jobs
        .route("/api/jobs", get(http::jobs::list_active))
        .route("/api/jobs/history", get(http::jobs::list_history))
        .route("/api/jobs/{id}", get(http::jobs::get_job))
        .route("/api/jobs/{id}/logs", get(http::jobs::get_logs))
        .route("/api/jobs/{id}/cancel", post(http::jobs::cancel_job))
        .route("/api/jobs/{id}/download", get(http::jobs::download_artifact))
        .route("/api/jobs/{id}/artifact", delete(http::jobs::cleanup_artifact))
        // manual operations
        .route("/api/backup", post(http::operations::start_backup))
        .route("/api/restore", post(http::operations::start_restore))
        .route("/api/sync", post(http::operations::start_sync))
        // connections
        .route(
            "/api/connections",
            get(http::connections::list).post(http::connections::create),
        )
        .route(
            "/api/connections/{id}",
            get(http::connections::get)
                .put(http::connections::update)
                .delete(http::connections::remove),
        )
        // schedules
        .route(
            "/api/schedules",
            get(http::schedules::list).post(http::schedules::create),
        )
        .route("/api/schedules/validate", post(http::schedules::validate))
        .route(
            "/api/schedules/{id}",
            get(http::schedules::get)
                .put(http::schedules::update)
                .delete(http::schedules::remove),
        )
        .route("/api/schedules/{id}/toggle", post(http::schedules::toggle))
        .route("/api/schedules/{id}/run", post(http::schedules::run_now))
        .route("/api/schedules/{id}/history", get(http::schedules::history))
        // settings
        .route(
            "/api/settings/timezone",
            get(http::settings::get_timezone).put(http::settings::set_timezone),
        )
        // backup catalog
        .route("/api/backups", get(http::backups::list))
        .route("/api/backups/{id}", delete(http::backups::remove))
        .route("/api/backups/{id}/download", get(http::backups::download))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

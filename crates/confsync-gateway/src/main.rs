use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use confsync_core::config::ConfsyncConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod app;
mod http;

/// confsync: backup, restore and sync between media-server instances,
/// on demand or on a schedule.
#[derive(Debug, Parser)]
#[command(name = "confsync", version, about)]
struct Cli {
    /// Config file (default: $CONFSYNC_CONFIG or ~/.confsync/confsync.toml).
    #[arg(short, long)]
    config: Option<String>,

    /// Directory for the database, work dirs and backup archives.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,
}

impl Cli {
    fn apply(self, config: &mut ConfsyncConfig) {
        if let Some(dir) = self.data_dir {
            config.storage.data_dir = dir;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confsync_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > CONFSYNC_CONFIG env > ~/.confsync/confsync.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CONFSYNC_CONFIG").ok());
    let mut config = ConfsyncConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ConfsyncConfig::default()
    });
    cli.apply(&mut config);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let sweep_every = Duration::from_secs(config.jobs.sweep_interval_secs.max(1));

    let state = Arc::new(app::AppState::open(config)?);
    let shutdown = CancellationToken::new();

    let dispatcher = state.scheduler.start()?;
    let sweeper = state.spawn_sweeper(sweep_every, shutdown.clone());

    let router = app::build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("confsync listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop timers and the sweeper; runs in flight are left to the restart
    // recovery path
    info!("shutting down");
    state.scheduler.shutdown();
    shutdown.cancel();
    let _ = tokio::join!(dispatcher, sweeper);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("could not listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

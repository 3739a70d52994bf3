//! Manual operations: POST /api/backup, /api/restore, /api/sync
//!
//! Each request resolves its connections, creates a job and hands it to the
//! executor in the background. The response is `202 Accepted` with
//! `{"job_id": "..."}`; progress is polled through `/api/jobs/{id}`.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use confsync_core::{CategorySet, ConfsyncError};
use confsync_pipeline::{run_job, BackupTarget, TaskRequest};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::error::ApiResult;
use crate::app::AppState;

#[derive(Deserialize)]
pub struct BackupBody {
    pub connection_id: String,
    #[serde(default = "CategorySet::all")]
    pub categories: CategorySet,
    /// Keep the archive in the backup catalog instead of offering it for
    /// a one-off download.
    #[serde(default)]
    pub save: bool,
}

#[derive(Deserialize)]
pub struct RestoreBody {
    pub connection_id: String,
    pub backup_id: String,
    #[serde(default = "CategorySet::all")]
    pub categories: CategorySet,
}

#[derive(Deserialize)]
pub struct SyncBody {
    pub source_id: String,
    pub destination_id: String,
    #[serde(default = "CategorySet::all")]
    pub categories: CategorySet,
}

pub async fn start_backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BackupBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_categories(&body.categories)?;
    let source = state.connections.require(&body.connection_id)?;
    let target = if body.save {
        BackupTarget::Catalog { schedule_id: None }
    } else {
        BackupTarget::Download
    };
    spawn_job(
        &state,
        TaskRequest::Backup {
            source,
            categories: body.categories,
            target,
        },
    )
}

pub async fn start_restore(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RestoreBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_categories(&body.categories)?;
    let destination = state.connections.require(&body.connection_id)?;
    if state.backups.get(&body.backup_id)?.is_none() {
        return Err(ConfsyncError::not_found("backup", &body.backup_id).into());
    }
    spawn_job(
        &state,
        TaskRequest::Restore {
            destination,
            backup_id: body.backup_id,
            categories: body.categories,
        },
    )
}

pub async fn start_sync(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SyncBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    require_categories(&body.categories)?;
    if body.source_id == body.destination_id {
        return Err(ConfsyncError::Validation("source and destination must differ".into()).into());
    }
    let source = state.connections.require(&body.source_id)?;
    let destination = state.connections.require(&body.destination_id)?;
    spawn_job(
        &state,
        TaskRequest::Sync {
            source,
            destination,
            categories: body.categories,
        },
    )
}

fn require_categories(categories: &CategorySet) -> Result<(), ConfsyncError> {
    if categories.is_empty() {
        return Err(ConfsyncError::Validation("select at least one category".into()));
    }
    Ok(())
}

fn spawn_job(state: &AppState, request: TaskRequest) -> ApiResult<(StatusCode, Json<Value>)> {
    let kind = request.kind();
    let job_id = state.registry.create_job(kind)?;
    info!(job_id = %job_id, %kind, "manual operation started");

    tokio::spawn(run_job(
        Arc::clone(&state.registry),
        Arc::clone(&state.executor),
        job_id.clone(),
        request,
    ));
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

//! Backup catalog: `/api/backups`

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Json,
};
use confsync_core::ConfsyncError;
use confsync_pipeline::BackupRecord;
use tokio_util::io::ReaderStream;

use super::error::ApiResult;
use super::jobs::zip_response;
use crate::app::AppState;

/// GET /api/backups: newest first.
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<BackupRecord>>> {
    Ok(Json(state.backups.list()?))
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let record = state
        .backups
        .get(&id)?
        .ok_or_else(|| ConfsyncError::not_found("backup", &id))?;
    let path = state.backups.path_of(&record);
    let file = tokio::fs::File::open(&path).await?;
    Ok(zip_response(&path, Body::from_stream(ReaderStream::new(file))))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.backups.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

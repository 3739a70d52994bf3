//! Job endpoints: `/api/jobs/*`
//!
//! Jobs are read straight from the registry. Cancellation is cooperative:
//! the job flips to `cancelled` immediately and its executor stops at the
//! next checkpoint.

use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use confsync_core::ConfsyncError;
use confsync_jobs::{Job, LogEntry};
use confsync_pipeline::WorkDirs;
use futures_util::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::error::ApiResult;
use crate::app::AppState;

pub const USER_CANCEL_REASON: &str = "Cancelled by user";

/// GET /api/jobs: pending and running jobs.
pub async fn list_active(State(state): State<Arc<AppState>>) -> Json<Vec<Job>> {
    Json(state.registry.get_all_jobs())
}

/// GET /api/jobs/history: terminal snapshots, newest first.
pub async fn list_history(State(state): State<Arc<AppState>>) -> Json<Vec<Job>> {
    Json(state.registry.get_history())
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> ApiResult<Json<Job>> {
    let job = state
        .registry
        .get_job(&id)
        .ok_or_else(|| ConfsyncError::not_found("job", &id))?;
    Ok(Json(job))
}

pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    Ok(Json(state.registry.get_logs(&id)?))
}

/// POST /api/jobs/{id}/cancel: 409 when the job already finished.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> ApiResult<Json<Job>> {
    state.registry.cancel_job(&id, USER_CANCEL_REASON)?;
    info!(job_id = %id, "cancellation requested");
    let job = state
        .registry
        .get_job(&id)
        .ok_or_else(|| ConfsyncError::not_found("job", &id))?;
    Ok(Json(job))
}

/// Removes the job's work dir once the response body is dropped.
struct CleanupOnDrop {
    work_dirs: Arc<WorkDirs>,
    job_id: String,
}

impl Drop for CleanupOnDrop {
    fn drop(&mut self) {
        if self.work_dirs.cleanup(&self.job_id) {
            debug!(job_id = %self.job_id, "work dir removed after download");
        }
    }
}

/// GET /api/jobs/{id}/download: stream the backup archive, then remove
/// the job's work dir.
pub async fn download_artifact(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> ApiResult<Response> {
    let archive = state
        .work_dirs
        .archive(&id)
        .ok_or_else(|| ConfsyncError::not_found("artifact", &id))?;
    let file = tokio::fs::File::open(&archive).await?;

    let guard = CleanupOnDrop {
        work_dirs: Arc::clone(&state.work_dirs),
        job_id: id,
    };
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _keep = &guard;
        chunk
    });
    Ok(zip_response(&archive, Body::from_stream(stream)))
}

/// DELETE /api/jobs/{id}/artifact: explicit work dir cleanup.
pub async fn cleanup_artifact(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> ApiResult<StatusCode> {
    if state.work_dirs.cleanup(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ConfsyncError::not_found("artifact", &id).into())
    }
}

pub(crate) fn zip_response(path: &Path, body: Body) -> Response {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "backup.zip".to_string());
    (
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}

//! Schedule endpoints: `/api/schedules/*`

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use confsync_core::config::SCHEDULE_HISTORY_LIMIT;
use confsync_scheduler::{RunHistoryEntry, Schedule, ScheduleDraft};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiResult;
use crate::app::AppState;

const DEFAULT_HISTORY_PAGE: usize = 20;

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Schedule>>> {
    Ok(Json(state.scheduler.list_schedules()?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ScheduleDraft>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    let schedule = state.scheduler.create_schedule(draft)?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(state.scheduler.get_schedule(&id)?))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(draft): Json<ScheduleDraft>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(state.scheduler.update_schedule(&id, draft)?))
}

/// DELETE /api/schedules/{id}: 409 while a run is in flight.
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.scheduler.delete_schedule(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(state.scheduler.toggle(&id)?))
}

/// POST /api/schedules/{id}/run: 202 with the job id, 409 if already running.
pub async fn run_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let job_id = state.scheduler.trigger_manual_run(&id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<RunHistoryEntry>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_PAGE)
        .clamp(1, SCHEDULE_HISTORY_LIMIT);
    Ok(Json(state.scheduler.get_history(&id, limit)?))
}

#[derive(Deserialize)]
pub struct ValidateBody {
    pub expression: String,
}

/// POST /api/schedules/validate: `{"valid": true, "next_runs": [...]}` or
/// `{"valid": false, "error": "..."}`.
pub async fn validate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ValidateBody>,
) -> Json<Value> {
    let timezone = state.scheduler.timezone();
    match state.scheduler.validate_expression(&body.expression) {
        Ok(runs) => Json(json!({
            "valid": true,
            "timezone": timezone.name(),
            "next_runs": runs,
        })),
        Err(e) => Json(json!({
            "valid": false,
            "timezone": timezone.name(),
            "error": e.to_string(),
        })),
    }
}

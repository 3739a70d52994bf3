//! Connection profiles: `/api/connections`
//!
//! Passwords are write-only: they are accepted on create/update and never
//! serialized back. An update with an empty password keeps the stored one.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use confsync_pipeline::{ConnectionDraft, ConnectionProfile};

use super::error::ApiResult;
use crate::app::AppState;

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ConnectionProfile>>> {
    Ok(Json(state.connections.list()?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ConnectionDraft>,
) -> ApiResult<(StatusCode, Json<ConnectionProfile>)> {
    let profile = state.connections.create(draft)?;
    Ok((StatusCode::CREATED, Json(profile)))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ConnectionProfile>> {
    Ok(Json(state.connections.require(&id)?))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(draft): Json<ConnectionDraft>,
) -> ApiResult<Json<ConnectionProfile>> {
    Ok(Json(state.connections.update(&id, draft)?))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.connections.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

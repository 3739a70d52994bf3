use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::error::ApiResult;
use crate::app::AppState;

#[derive(Deserialize)]
pub struct TimezoneBody {
    pub timezone: String,
}

/// GET /api/settings/timezone
pub async fn get_timezone(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "timezone": state.scheduler.timezone().name() }))
}

/// PUT /api/settings/timezone: re-registers every enabled schedule.
pub async fn set_timezone(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TimezoneBody>,
) -> ApiResult<Json<Value>> {
    state.scheduler.reinitialize_with_timezone(body.timezone.trim())?;
    info!(timezone = %body.timezone, "scheduling timezone changed");
    Ok(Json(json!({ "timezone": state.scheduler.timezone().name() })))
}

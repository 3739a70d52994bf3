use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe, returns server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("CONFSYNC_GIT_SHA"),
        "active_jobs": state.registry.get_all_jobs().len(),
        "timezone": state.scheduler.timezone().name(),
    }))
}

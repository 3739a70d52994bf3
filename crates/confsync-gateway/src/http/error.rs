//! JSON error responses.
//!
//! Every handler returns `Result<_, ApiError>`. Any crate error converts via
//! `ConfsyncError`, so `?` works on registry, store and scheduler calls alike.
//!
//! Body: `{"error": "...", "code": "NOT_FOUND"}`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use confsync_core::ConfsyncError;
use serde_json::json;
use tracing::{error, warn};

#[derive(Debug)]
pub struct ApiError(pub ConfsyncError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ConfsyncError::Validation(_) => StatusCode::BAD_REQUEST,
            ConfsyncError::NotFound { .. } => StatusCode::NOT_FOUND,
            ConfsyncError::Conflict(_) | ConfsyncError::Cancelled => StatusCode::CONFLICT,
            ConfsyncError::Authentication(_) | ConfsyncError::Remote(_) => StatusCode::BAD_GATEWAY,
            ConfsyncError::Config(_)
            | ConfsyncError::Database(_)
            | ConfsyncError::Serialization(_)
            | ConfsyncError::Io(_)
            | ConfsyncError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<ConfsyncError>,
{
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            warn!(code = self.0.code(), error = %self.0, "request rejected");
        }
        let body = json!({ "error": self.0.to_string(), "code": self.0.code() });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

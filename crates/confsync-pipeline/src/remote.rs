use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::connections::ConnectionProfile;

/// Capability to talk to one remote instance's JSON API.
///
/// Implementations authenticate on their own and retry a call exactly once
/// after re-authenticating when the server reports expired authorization.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Label for logs (usually the connection name).
    fn name(&self) -> &str;

    /// Obtain fresh credentials. The pipeline calls this first so bad
    /// credentials fail the job before any work is done.
    async fn authenticate(&self) -> Result<(), RemoteError>;

    async fn get(&self, endpoint: &str) -> Result<Value, RemoteError>;

    async fn post(&self, endpoint: &str, payload: &Value) -> Result<Value, RemoteError>;

    async fn put(&self, endpoint: &str, payload: &Value) -> Result<Value, RemoteError>;

    async fn patch(&self, endpoint: &str, payload: &Value) -> Result<Value, RemoteError>;

    async fn delete(&self, endpoint: &str) -> Result<Value, RemoteError>;

    /// Raw bytes of an asset (logo image). Relative endpoints resolve
    /// against the instance, absolute URLs are fetched as-is.
    async fn download(&self, endpoint: &str) -> Result<Vec<u8>, RemoteError>;
}

/// Builds a [`RemoteClient`] for a stored connection profile.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, profile: &ConnectionProfile) -> Result<Arc<dyn RemoteClient>, RemoteError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Credentials rejected, including after the single re-auth retry.
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

impl RemoteError {
    /// Errors that must abort the whole pipeline rather than one record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RemoteError::Auth(_))
    }
}

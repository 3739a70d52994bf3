use thiserror::Error;

/// Error taxonomy shared by every confsync subsystem.
///
/// Crate-local errors convert into this type at API boundaries so callers
/// can branch on the category without knowing which subsystem failed.
#[derive(Debug, Error)]
pub enum ConfsyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad input from a caller.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// The request collides with in-flight work (delete or manual run while running).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The remote instance rejected our credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Cooperative cancellation observed at a checkpoint.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConfsyncError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        ConfsyncError::NotFound { what, id: id.into() }
    }

    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            ConfsyncError::Config(_) => "CONFIG_ERROR",
            ConfsyncError::Validation(_) => "VALIDATION_ERROR",
            ConfsyncError::NotFound { .. } => "NOT_FOUND",
            ConfsyncError::Conflict(_) => "CONFLICT",
            ConfsyncError::Authentication(_) => "AUTHENTICATION_FAILED",
            ConfsyncError::Cancelled => "CANCELLED",
            ConfsyncError::Remote(_) => "REMOTE_ERROR",
            ConfsyncError::Database(_) => "DATABASE_ERROR",
            ConfsyncError::Serialization(_) => "SERIALIZATION_ERROR",
            ConfsyncError::Io(_) => "IO_ERROR",
            ConfsyncError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfsyncError>;

//! Infrastructure error types.
//!
//! `AppError` covers configuration, persistence and IO failures on the
//! control path. Request-path errors live in [`crate::forward::error`] and
//! carry their own HTTP mapping.

/// Application-wide error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for app operations
pub type AppResult<T> = Result<T, AppError>;

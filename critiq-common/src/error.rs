//! Common error types for Critiq

use thiserror::Error;

/// Common result type for Critiq operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across Critiq stages
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Stage precondition violated; the stage must abort without a manifest
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

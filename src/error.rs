//! Error types for the Ratewarden service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy store or request counter errors that are not database errors
    #[error("Store error: {0}")]
    Store(String),

    /// An external read did not finish in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// SQLite backend errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Policy file parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

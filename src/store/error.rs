//! Cache/queue store error types

use thiserror::Error;

/// Errors that can occur in a store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite backend failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Requested job does not exist
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// A blocking store task panicked or was cancelled
    #[error("Store task failed: {0}")]
    Task(String),

    /// Unknown backend or bad backend settings
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        StoreError::Lock(err.to_string())
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

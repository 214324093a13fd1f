//! Error types for the core library.

use thiserror::Error;

use crate::mail::StoreError;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Mail store operation failed.
    #[error("Mail store error: {0}")]
    Store(#[from] StoreError),

    /// A category name is not part of the configured taxonomy.
    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    /// Persisted state could not be read and the policy forbids a reset.
    #[error("Corrupt state file {path}: {reason}")]
    CorruptState {
        /// Path of the unreadable state file.
        path: String,
        /// Why it could not be loaded.
        reason: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

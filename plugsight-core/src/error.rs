//! Error types for plugsight-core

use thiserror::Error;

/// Main error type for the plugsight-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (I/O, constraint violation, serialization inside SQLite)
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed query, unknown category, or out-of-range parameter
    #[error("validation error: {0}")]
    Validation(String),

    /// Per-record failure during bulk ingest
    #[error("indexing error for plugin {plugin_id}: {message}")]
    Indexing { plugin_id: String, message: String },

    /// Requested plugin does not exist
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Short human-readable message suitable for response envelopes.
    ///
    /// Storage internals never cross the API boundary; the full error is
    /// logged where it occurred.
    pub fn user_message(&self) -> String {
        match self {
            Error::Store(_) => "storage operation failed".to_string(),
            Error::Io(_) => "I/O failure".to_string(),
            Error::Json(_) => "serialization failed".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for plugsight-core
pub type Result<T> = std::result::Result<T, Error>;

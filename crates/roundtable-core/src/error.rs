//! Error types for the Roundtable core library.

use thiserror::Error;

/// Result type alias using the Roundtable core Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Roundtable operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend stream event parsing error
    #[error("Failed to parse stream event: {0}")]
    EventParse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

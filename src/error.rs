//! Error types for the tracker

use thiserror::Error;

/// Main error type for the tracker
#[derive(Error, Debug)]
pub enum Error {
    /// Read against a metric that has never been tracked
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    /// Update or query through an id/alias that does not resolve
    /// (never issued, or the alias edit window has expired)
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Chart step of zero or less
    #[error("Invalid chart step: {0}")]
    InvalidStep(f64),

    /// Chart window specification matches no supported case
    #[error("Invalid chart options: {0}")]
    InvalidOptions(String),

    /// Schema migration step failure
    #[error("Schema update failed: {0}")]
    UpdateError(String),

    /// Connection to the store failed, or a command failed after retries
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Stored data is malformed
    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

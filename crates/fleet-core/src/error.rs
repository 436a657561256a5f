//! Error types for `Fleet` core library.

use thiserror::Error;

/// Result type alias using `Fleet` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Fleet` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File lock could not be acquired or released
    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),

    /// Structured output could not be parsed
    #[error(transparent)]
    Parse(#[from] crate::parse::ParseError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

//! Error types for the session storage engine.

use thiserror::Error;

/// Errors that can occur in session storage operations.
///
/// Only the construction-time variants ([`Error::Config`] and
/// [`Error::UnsupportedSchemaVersion`]) ever reach callers of the storage
/// contract; runtime failures are logged and absorbed by the backends.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction-time configuration (bad identifier, unusable
    /// connection source)
    #[error("configuration error: {0}")]
    Config(String),

    /// A table schema version other than the ones this build defines
    #[error("unsupported schema version: {0}")]
    UnsupportedSchemaVersion(i32),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization / deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// General internal error
    #[error("{0}")]
    Internal(String),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the build core.

use thiserror::Error;

/// Errors surfaced by the build graph, snapshot lifecycle, DiffKey
/// canonicalization, and content-addressable cache subsystems.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing entity (container/snapshot/index entry).
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate id or hostname.
    #[error("already exists: {0}")]
    Exists(String),

    /// Illegal snapshot transition or operation issued against the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Unparseable DiffKey or bad manifest.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Content store I/O or ingest failure.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Unexpected UTF-8 failure on canonical serialization.
    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    /// Operation executor body raised an error.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Executor received an operation it does not claim.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageFailure(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidFormat(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::StorageFailure(err.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

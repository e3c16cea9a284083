//! Error types for data store operations.
//!
//! Absence of a path is never an error: it is reported through empty lists,
//! `false` or `None`. Everything here is a real failure of the backend, the
//! configuration or the caller's input.

use thiserror::Error;

/// Errors that can occur during data store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error (disk, permissions, streams).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error from SQLx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Error reported by the filesystem watcher.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Path cannot be mapped onto the backend (e.g. escapes the root).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Backend cannot serve requests (misconfigured, disconnected).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Operation on a store that has been closed.
    #[error("store closed: {0}")]
    Closed(String),

    /// Destination size differs from the source after copying.
    #[error("partial copy of {path}: expected {expected} bytes, found {found}")]
    PartialCopy {
        path: String,
        expected: u64,
        found: u64,
    },
}

/// Result type alias for data store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Returns true if this error is likely transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Database(_) | StoreError::Unavailable(_)
        )
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        StoreError::Config(message.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::InvalidPath("/../etc".to_string());
        assert!(err.to_string().contains("invalid path"));
        assert!(err.to_string().contains("/../etc"));
    }

    #[test]
    fn test_partial_copy_display() {
        let err = StoreError::PartialCopy {
            path: "/a".to_string(),
            expected: 5,
            found: 3,
        };
        assert!(err.to_string().contains("expected 5"));
        assert!(err.to_string().contains("found 3"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(StoreError::Unavailable("db down".to_string()).is_retryable());
        assert!(StoreError::Io(std::io::Error::other("disk")).is_retryable());
        assert!(!StoreError::Config("bad".to_string()).is_retryable());
        assert!(!StoreError::Closed("mem".to_string()).is_retryable());
    }

    #[test]
    fn test_from_json_error() {
        let err: StoreError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}

//! Error types for stow_core.

use crate::pool::CasPool;
use crate::strategy::PlacementAction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using stow_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store, collection and materialization operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A placement action (symlink, hard link, copy) failed.
    #[error("failed to {action} {path}: {source}")]
    FailedToPlace {
        action: PlacementAction,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Content did not hash to the digest it was declared with.
    #[error("Hash mismatch for {subject}: expected {expected}, got {actual}")]
    HashMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    /// Object file is corrupted or invalid.
    #[error("Corrupted object at {path}: {reason}")]
    CorruptedObject { path: PathBuf, reason: String },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Object not found in store.
    #[error("Object not found: {hash}")]
    ObjectNotFound { hash: String },

    /// Pool is invalid or not initialized.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Configuration was rejected before the store was opened.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The requested pool has no root configured.
    #[error("Pool {pool} is not configured")]
    PoolUnavailable { pool: CasPool },

    /// Writing an object would exceed the configured size limit.
    #[error("Pool {pool} is full: {requested} bytes requested, limit is {limit} bytes")]
    PoolFull {
        pool: CasPool,
        requested: u64,
        limit: u64,
    },

    /// A manifest failed validation.
    #[error("Invalid manifest entry {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    /// Two manifest entries disagree about the content of one path.
    #[error("Conflicting manifest entries for {path}: {first} vs {second}")]
    ManifestConflict {
        path: PathBuf,
        first: String,
        second: String,
    },

    /// A download failed.
    #[error("Failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A URL scheme the primitives cannot fetch.
    #[error("Unsupported URL: {url}")]
    UnsupportedUrl { url: String },

    /// Patch application failed.
    #[error("Failed to apply patch to {path}: {reason}")]
    Patch { path: PathBuf, reason: String },

    /// The operation was cancelled.
    #[error("operation was cancelled")]
    Cancelled,

    /// Unsupported algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// JSON (de)serialization failed.
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    /// Filesystem failures: unwritable paths, full disks, denied placements.
    Io,
    /// Content that does not match its declared hash.
    Integrity,
    /// Failures talking to a remote.
    Network,
    /// Rejected configuration or manifest input.
    Configuration,
    /// Conflicting manifest entries.
    Conflict,
    /// Missing objects or sources.
    NotFound,
    /// Work that was never finished because the run was cancelled.
    Cancelled,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Io => "io",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::Network => "network",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::NotFound => "not-found",
            ErrorCategory::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Create a CorruptedObject error.
    pub fn corrupted_object(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CorruptedObject {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create a HashMismatch error.
    pub fn hash_mismatch(
        subject: impl Into<String>,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Error::HashMismatch {
            subject: subject.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create an ObjectNotFound error.
    pub fn object_not_found(hash: impl Into<String>) -> Self {
        Error::ObjectNotFound { hash: hash.into() }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an InvalidManifest error.
    pub fn invalid_manifest(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidManifest {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a FailedToPlace error.
    pub fn failed_to_place(
        action: PlacementAction,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Error::FailedToPlace {
            action,
            path: path.into(),
            source,
        }
    }

    /// Create a Patch error.
    pub fn patch(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Patch {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Io { .. }
            | Error::FailedToPlace { .. }
            | Error::PoolFull { .. }
            | Error::Patch { .. } => ErrorCategory::Io,
            Error::HashMismatch { .. } | Error::CorruptedObject { .. } => ErrorCategory::Integrity,
            Error::Download { .. } | Error::UnsupportedUrl { .. } => ErrorCategory::Network,
            Error::InvalidHash { .. }
            | Error::InvalidStore { .. }
            | Error::InvalidConfig { .. }
            | Error::PoolUnavailable { .. }
            | Error::InvalidManifest { .. }
            | Error::UnsupportedAlgorithm { .. }
            | Error::Json { .. } => ErrorCategory::Configuration,
            Error::ManifestConflict { .. } => ErrorCategory::Conflict,
            Error::ObjectNotFound { .. } => ErrorCategory::NotFound,
            Error::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Returns true for integrity failures, which are never retried or placed.
    pub fn is_integrity(&self) -> bool {
        self.category() == ErrorCategory::Integrity
    }

    /// Returns true if a download that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Download { source, .. } => {
                source.is_timeout()
                    || source.is_connect()
                    || source.is_request()
                    || source.status().is_some_and(|status| {
                        status.is_server_error()
                            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                            || status == reqwest::StatusCode::REQUEST_TIMEOUT
                    })
            }
            Error::Io { source } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::StorageFull
            ),
            _ => false,
        }
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<tempfile::PathPersistError> for Error {
    fn from(err: tempfile::PathPersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        match err.try_into_panic() {
            Ok(panic) => std::panic::resume_unwind(panic),
            Err(_) => Error::Cancelled,
        }
    }
}

/// A serializable, clonable snapshot of an [`Error`], recorded in per-file outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&Error> for FileError {
    fn from(err: &Error) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
        }
    }
}

impl From<Error> for FileError {
    fn from(err: Error) -> Self {
        FileError::from(&err)
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::hash_mismatch("a", "h1", "h2").category(),
            ErrorCategory::Integrity
        );
        assert_eq!(
            Error::invalid_config("bad").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(Error::Cancelled.category(), ErrorCategory::Cancelled);
        assert_eq!(
            Error::object_not_found("abc").category(),
            ErrorCategory::NotFound
        );
    }

    #[test]
    fn test_integrity_is_never_retryable() {
        let err = Error::hash_mismatch("file", "aa", "bb");
        assert!(err.is_integrity());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_retryable_kinds() {
        let transient = Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(transient.is_retryable());

        let missing = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_file_error_snapshot() {
        let err = Error::hash_mismatch("mods/a.pak", "aa", "bb");
        let snapshot = FileError::from(&err);
        assert_eq!(snapshot.category, ErrorCategory::Integrity);
        assert!(snapshot.message.contains("mods/a.pak"));
        assert!(snapshot.to_string().starts_with("integrity: "));
    }
}

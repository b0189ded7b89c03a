//! Centralized error types for mailindex.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mailindex library.
#[derive(Error, Debug)]
pub enum IndexError {
    /// I/O error with the associated file path.
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// One message file could not be parsed. Callers skip it and continue.
    #[error("Malformed message '{path}': {reason}")]
    MalformedMessage { path: PathBuf, reason: String },

    /// A message or attachment file is above the size cap.
    #[error("File '{path}' is {size} bytes, above the {limit} byte limit")]
    OversizedFile { path: PathBuf, size: u64, limit: u64 },

    /// A watcher event pointed outside the mail store root.
    #[error("Path escapes the mail store root: {0}")]
    PathTraversal(PathBuf),

    /// The search query is empty or has nothing searchable left after escaping.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The index file cannot be opened or locked.
    #[error("Index storage unavailable at '{path}': {reason}. Retry, or rebuild the index")]
    StorageUnavailable { path: PathBuf, reason: String },

    /// The on-disk schema cannot be migrated to the version this build expects.
    #[error("Index schema version {found} is incompatible with {expected}. Rebuild the index from scratch")]
    SchemaMismatch { found: i64, expected: i64 },

    /// The mail store directory does not exist or is not readable.
    #[error("Mail store not found: {0}")]
    MailStoreNotFound(PathBuf),

    /// A message or attachment lookup found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller cancelled a long-running operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// SQLite reported an error on an already open store.
    #[error("Storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The filesystem watcher could not be set up.
    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),
}

/// Convenience alias for `Result<T, IndexError>`.
pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `MalformedMessage` variant.
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// `true` for failures that only concern one file and must not abort a batch.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage { .. } | Self::OversizedFile { .. } | Self::Io { .. }
        )
    }
}

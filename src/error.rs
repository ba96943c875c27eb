//! Centralized error types for listarchive.

use std::path::PathBuf;
use thiserror::Error;

use crate::ingest::RunSummary;

/// Errors that end an ingestion run or a query.
///
/// Per-message problems are never reported through this type: they are
/// classified by the analyzer and recorded as load errors instead.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// I/O error with the associated file path.
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The specified file or directory does not exist.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// The mailbox could not be split into messages.
    #[error("Failed to split mbox '{path}': {reason}")]
    InvalidMbox { path: PathBuf, reason: String },

    /// The storage layer failed (connectivity, constraint, schema).
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The target list does not exist in the archive.
    #[error("List {0} not found")]
    ListNotFound(String),

    /// A list with this name already exists.
    #[error("List {0} already exists")]
    ListExists(String),

    /// The requested thread has no messages.
    #[error("Thread {0} not found")]
    ThreadNotFound(i64),

    /// A message source produced an unrecoverable read error.
    ///
    /// `summary` holds the tallies of what the archive kept: work committed
    /// before the failure, plus the failure itself.
    #[error("Fatal source error: {reason}")]
    Aborted {
        reason: String,
        summary: Box<RunSummary>,
    },
}

/// Convenience alias for `Result<T, ArchiveError>`.
pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Like [`ArchiveError::io`], but maps `NotFound` to [`ArchiveError::FileNotFound`].
    pub fn open(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::FileNotFound(path)
        } else {
            Self::Io { path, source }
        }
    }
}

//! Message sources: a single stream, a directory of files, or an mbox archive.
//!
//! A source only reads bytes. It yields one [`RawMessage`] per message, or a
//! [`SourceError`] for an entry it could not produce.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::error::{ArchiveError, Result};
use crate::model::message::{RawMessage, SourceKind};
use crate::parser::mbox::{self, MboxSpan, MboxSplitter};

/// Why a source could not produce one entry.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Reading the source itself failed.
    #[error("cannot read {locator}: {source}")]
    Io {
        kind: SourceKind,
        locator: String,
        source: std::io::Error,
    },

    /// The entry is larger than the configured limit.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Oversized {
        kind: SourceKind,
        locator: String,
        size: u64,
        limit: u64,
    },
}

impl SourceError {
    /// Whether this error invalidates the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Io { kind, .. } | Self::Oversized { kind, .. } => *kind,
        }
    }

    pub fn locator(&self) -> &str {
        match self {
            Self::Io { locator, .. } | Self::Oversized { locator, .. } => locator,
        }
    }
}

/// A finite, lazy sequence of raw messages.
pub enum MessageSource {
    /// Exactly one message, already read.
    Single(Option<RawMessage>),

    /// One message per regular file.
    Directory {
        files: std::vec::IntoIter<PathBuf>,
        max_size: u64,
    },

    /// One message per mbox span.
    Mbox {
        path: PathBuf,
        file: File,
        spans: std::vec::IntoIter<MboxSpan>,
        max_size: u64,
    },
}

impl MessageSource {
    /// Read one message from a stream (usually stdin).
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| ArchiveError::io("<stdin>", e))?;
        Ok(Self::Single(Some(RawMessage {
            bytes,
            kind: SourceKind::Stdin,
            locator: String::new(),
        })))
    }

    /// List the regular files of a directory, sorted by name.
    ///
    /// Subdirectories and other non-files are not messages and are skipped.
    pub fn directory(dir: &Path, max_size: u64) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| ArchiveError::open(dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ArchiveError::io(dir, e))?;
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            } else {
                debug!(path = %path.display(), "Skipping non-file directory entry");
            }
        }
        files.sort();
        Ok(Self::Directory {
            files: files.into_iter(),
            max_size,
        })
    }

    /// Split an mbox up front.
    ///
    /// A malformed archive fails here, before any message is produced.
    pub fn mbox(path: &Path, max_size: u64) -> Result<Self> {
        let splitter = MboxSplitter::new(path)?;
        let spans = splitter.split()?;
        let file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
        Ok(Self::Mbox {
            path: path.to_path_buf(),
            file,
            spans: spans.into_iter(),
            max_size,
        })
    }

    /// Source type of every message this source yields.
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Single(_) => SourceKind::Stdin,
            Self::Directory { .. } => SourceKind::Directory,
            Self::Mbox { .. } => SourceKind::Mbox,
        }
    }

    /// Number of messages left, when known up front.
    pub fn remaining(&self) -> usize {
        match self {
            Self::Single(msg) => usize::from(msg.is_some()),
            Self::Directory { files, .. } => files.len(),
            Self::Mbox { spans, .. } => spans.len(),
        }
    }
}

impl Iterator for MessageSource {
    type Item = std::result::Result<RawMessage, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Single(msg) => msg.take().map(Ok),
            Self::Directory { files, max_size } => {
                let path = files.next()?;
                Some(read_file(&path, *max_size))
            }
            Self::Mbox {
                path,
                file,
                spans,
                max_size,
            } => {
                let span = spans.next()?;
                Some(read_mbox_entry(file, path, span, *max_size))
            }
        }
    }
}

fn read_file(path: &Path, max_size: u64) -> std::result::Result<RawMessage, SourceError> {
    let locator = path.display().to_string();
    let io_err = |source| SourceError::Io {
        kind: SourceKind::Directory,
        locator: path.display().to_string(),
        source,
    };

    let size = std::fs::metadata(path).map_err(io_err)?.len();
    if size > max_size {
        return Err(SourceError::Oversized {
            kind: SourceKind::Directory,
            locator,
            size,
            limit: max_size,
        });
    }
    let bytes = std::fs::read(path).map_err(io_err)?;
    Ok(RawMessage {
        bytes,
        kind: SourceKind::Directory,
        locator,
    })
}

fn read_mbox_entry(
    file: &mut File,
    path: &Path,
    span: MboxSpan,
    max_size: u64,
) -> std::result::Result<RawMessage, SourceError> {
    let locator = format!("{}:{}", path.display(), span.offset);
    if span.length > max_size {
        return Err(SourceError::Oversized {
            kind: SourceKind::Mbox,
            locator,
            size: span.length,
            limit: max_size,
        });
    }
    match mbox::read_span(file, path, span) {
        Ok(entry) => Ok(RawMessage {
            bytes: mbox::unescape_entry(&entry),
            kind: SourceKind::Mbox,
            locator,
        }),
        Err(ArchiveError::Io { source, .. }) => Err(SourceError::Io {
            kind: SourceKind::Mbox,
            locator,
            source,
        }),
        Err(other) => Err(SourceError::Io {
            kind: SourceKind::Mbox,
            locator,
            source: std::io::Error::other(other.to_string()),
        }),
    }
}

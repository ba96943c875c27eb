//! Streaming mbox splitter.
//!
//! Scans the archive once, line by line, and records the byte span of every
//! message. Messages are read back one at a time by span, so the archive is
//! never held in memory as a whole.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ArchiveError, Result};

/// Size of the internal read buffer.
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Location of one message inside an mbox file.
///
/// `offset` points at the `From ` separator line; `length` runs up to the
/// next separator or EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MboxSpan {
    pub offset: u64,
    pub length: u64,
}

/// Splits an mbox file into message spans.
///
/// Tolerates mixed `\n`/`\r\n` line endings, a UTF-8 BOM, separators not
/// preceded by a blank line, and binary bytes in bodies. Leading text before
/// the first separator is the one thing it refuses: such a file is not an
/// mbox and the whole load must fail.
pub struct MboxSplitter {
    path: PathBuf,
    file_size: u64,
}

impl MboxSplitter {
    /// Open an mbox for splitting. Fails if the file is missing or unreadable.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|e| ArchiveError::open(&path, e))?;
        if !metadata.is_file() {
            return Err(ArchiveError::InvalidMbox {
                path,
                reason: "not a regular file".into(),
            });
        }
        Ok(Self {
            path,
            file_size: metadata.len(),
        })
    }

    /// Scan the whole file and return one span per message.
    pub fn split(&self) -> Result<Vec<MboxSpan>> {
        let mut spans = Vec::new();
        if self.file_size == 0 {
            return Ok(spans);
        }

        let file = File::open(&self.path).map_err(|e| ArchiveError::io(&self.path, e))?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

        let mut line_buf: Vec<u8> = Vec::with_capacity(4096);
        let mut offset: u64 = 0;
        let mut message_start: Option<u64> = None;
        let mut prev_line_was_empty = true;

        loop {
            line_buf.clear();
            let line_len = reader
                .read_until(b'\n', &mut line_buf)
                .map_err(|e| ArchiveError::io(&self.path, e))? as u64;
            if line_len == 0 {
                break;
            }

            if is_mbox_separator(&line_buf) {
                if let Some(start) = message_start {
                    if !prev_line_was_empty {
                        warn!(offset, "Found 'From ' separator without preceding blank line");
                    }
                    spans.push(MboxSpan {
                        offset: start,
                        length: offset - start,
                    });
                }
                message_start = Some(offset);
            } else if message_start.is_none() && !is_blank_line(&line_buf) {
                return Err(ArchiveError::InvalidMbox {
                    path: self.path.clone(),
                    reason: format!("unexpected data before first 'From ' line at offset {offset}"),
                });
            }

            prev_line_was_empty = is_blank_line(&line_buf);
            offset += line_len;
        }

        if let Some(start) = message_start {
            spans.push(MboxSpan {
                offset: start,
                length: offset - start,
            });
        }

        debug!(path = %self.path.display(), messages = spans.len(), "Split mbox");
        Ok(spans)
    }
}

/// Read one span back from the file.
pub fn read_span(file: &mut File, path: &Path, span: MboxSpan) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(span.offset))
        .map_err(|e| ArchiveError::io(path, e))?;
    let mut buffer = vec![0u8; span.length as usize];
    file.read_exact(&mut buffer)
        .map_err(|e| ArchiveError::io(path, e))?;
    Ok(buffer)
}

/// Turn an mbox entry into a plain RFC 5322 message.
///
/// Drops the `From ` separator line and undoes mboxrd quoting (`>From ` ⇒
/// `From `, `>>From ` ⇒ `>From `), so the result is byte-identical to the
/// same message stored as a standalone file.
pub fn unescape_entry(entry: &[u8]) -> Vec<u8> {
    let entry = entry.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(entry);
    let body = if entry.starts_with(b"From ") {
        match entry.iter().position(|&b| b == b'\n') {
            Some(pos) => &entry[pos + 1..],
            None => &[][..],
        }
    } else {
        entry
    };

    let mut out = Vec::with_capacity(body.len());
    for line in body.split_inclusive(|&b| b == b'\n') {
        let quotes = line.iter().take_while(|&&b| b == b'>').count();
        if quotes > 0 && line[quotes..].starts_with(b"From ") {
            out.extend_from_slice(&line[1..]);
        } else {
            out.extend_from_slice(line);
        }
    }

    // The blank line before the next separator belongs to the framing
    if out.ends_with(b"\r\n\r\n") {
        out.truncate(out.len() - 2);
    } else if out.ends_with(b"\n\n") {
        out.truncate(out.len() - 1);
    }
    out
}

/// Check whether a line is an mbox separator (`From ` at the start).
fn is_mbox_separator(line: &[u8]) -> bool {
    let line = line.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(line);
    line.starts_with(b"From ")
}

/// Check whether a line is blank (empty or only whitespace / CR / LF).
fn is_blank_line(line: &[u8]) -> bool {
    line.iter()
        .all(|&b| b == b'\n' || b == b'\r' || b == b' ' || b == b'\t')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_mbox(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_is_mbox_separator() {
        assert!(is_mbox_separator(b"From user@example.com Thu Jan 01 00:00:00 2024\n"));
        assert!(!is_mbox_separator(b"from user@example.com\n"));
        assert!(!is_mbox_separator(b">From user@example.com\n"));
        assert!(!is_mbox_separator(b"Subject: From here\n"));
    }

    #[test]
    fn test_split_three_messages() {
        let f = write_mbox(
            b"From a@x Mon Jan  1 00:00:00 2024\nSubject: one\n\nbody\n\n\
From b@x Mon Jan  1 00:00:00 2024\nSubject: two\n\n>From the start\n\n\
From c@x Mon Jan  1 00:00:00 2024\r\nSubject: three\r\n\r\nbody",
        );
        let spans = MboxSplitter::new(f.path()).unwrap().split().unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].offset, 0);
        assert_eq!(spans[1].offset, spans[0].length);
        let total: u64 = spans.iter().map(|s| s.length).sum();
        assert_eq!(total, std::fs::metadata(f.path()).unwrap().len());
    }

    #[test]
    fn test_split_empty_file() {
        let f = write_mbox(b"");
        let spans = MboxSplitter::new(f.path()).unwrap().split().unwrap();
        assert!(spans.is_empty());
    }

    #[test]
    fn test_split_rejects_non_mbox() {
        let f = write_mbox(b"Subject: not an mbox\n\nhello\n");
        let err = MboxSplitter::new(f.path()).unwrap().split().unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidMbox { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = MboxSplitter::new("/nonexistent/archive.mbox").err().unwrap();
        assert!(matches!(err, ArchiveError::FileNotFound(_)));
    }

    #[test]
    fn test_read_span_and_unescape() {
        let f = write_mbox(
            b"From a@x Mon Jan  1 00:00:00 2024\nSubject: one\n\n>From here\n>>From there\n",
        );
        let spans = MboxSplitter::new(f.path()).unwrap().split().unwrap();
        let mut file = File::open(f.path()).unwrap();
        let raw = read_span(&mut file, f.path(), spans[0]).unwrap();
        assert_eq!(
            unescape_entry(&raw),
            b"Subject: one\n\nFrom here\n>From there\n".to_vec()
        );
    }

    #[test]
    fn test_unescape_drops_framing_blank_line() {
        let entry = b"From a@x Mon Jan  1 00:00:00 2024\nSubject: one\n\nbody\n\n";
        assert_eq!(unescape_entry(entry), b"Subject: one\n\nbody\n".to_vec());
    }
}

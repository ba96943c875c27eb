//! Raw and parsed message records flowing through the ingestion pipeline.

use chrono::{DateTime, Utc};

use super::address::EmailAddress;
use super::attachment::Attachment;

/// Where a raw message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Stdin,
    Directory,
    Mbox,
}

impl SourceKind {
    /// Name recorded in `loaderrors.srctype`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Directory => "directory",
            Self::Mbox => "mbox",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unparsed message plus its provenance. Lives only during ingestion.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub bytes: Vec<u8>,
    pub kind: SourceKind,
    /// File path (directory), `path:offset` (mbox) or empty (stdin).
    pub locator: String,
}

/// Structured view of one message.
///
/// Every header is optional: the parser reports what it found and leaves
/// validation to the analyzer.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    /// `Message-ID` without angle brackets.
    pub message_id: Option<String>,

    /// `In-Reply-To` ids, in header order.
    pub in_reply_to: Vec<String>,

    /// `References` ids, oldest first.
    pub references: Vec<String>,

    /// Canonical parent: first `In-Reply-To` id, else last `References` id.
    pub parent_id: Option<String>,

    /// Raw `Date` header value, if any.
    pub date_header: Option<String>,

    /// Parsed `Date`; `None` when missing or unparseable.
    pub date: Option<DateTime<Utc>>,

    pub subject: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,

    /// `List-Id` value without angle brackets.
    pub list_id: Option<String>,

    /// Plain-text body (HTML-only messages are converted).
    pub body: String,

    pub attachments: Vec<Attachment>,

    /// The complete source, decoded lossily, kept for raw retrieval.
    pub raw: String,
}

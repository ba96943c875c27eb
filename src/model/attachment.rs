//! Attachment parts extracted from a message.

/// A decoded MIME attachment.
///
/// Owned by its message until stored; the archive then addresses it by a
/// synthetic id rather than by the message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Filename from `Content-Disposition`/`Content-Type`, or a generated one.
    pub filename: String,

    /// MIME content type (e.g. `"application/pdf"`).
    pub content_type: String,

    /// Decoded payload (transfer encoding already removed).
    pub data: Vec<u8>,
}

impl Attachment {
    /// Decoded size in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

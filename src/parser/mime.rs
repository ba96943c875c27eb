//! MIME structure: body text and attachment extraction.

use mail_parser::{MessageParser, MimeHeaders};
use tracing::debug;

use crate::model::attachment::Attachment;

use super::header::split_message;

/// Body text and attachments of one message.
#[derive(Debug, Clone, Default)]
pub struct MimeContent {
    pub body: String,
    pub attachments: Vec<Attachment>,
}

/// Extract the body text and attachments from a complete raw message.
///
/// Malformed MIME never fails: when `mail-parser` gives up, everything after
/// the header block is taken as the body and there are no attachments.
pub fn extract_content(raw_message: &[u8]) -> MimeContent {
    let Some(msg) = MessageParser::default().parse(raw_message) else {
        debug!("MIME parse failed, using raw body");
        return MimeContent {
            body: extract_body_fallback(raw_message),
            attachments: Vec::new(),
        };
    };

    // body_text converts an HTML-only body to text on its own
    let body = msg
        .body_text(0)
        .map(|s| s.into_owned())
        .unwrap_or_default();

    let attachments = msg
        .attachments()
        .enumerate()
        .map(|(idx, part)| Attachment {
            filename: part
                .attachment_name()
                .map(String::from)
                .unwrap_or_else(|| format!("attachment_{idx}")),
            content_type: part
                .content_type()
                .map(|ct: &mail_parser::ContentType| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string())
                .to_lowercase(),
            data: part.contents().to_vec(),
        })
        .collect();

    MimeContent { body, attachments }
}

/// Everything after the first blank line, decoded lossily.
fn extract_body_fallback(data: &[u8]) -> String {
    let (_, body) = split_message(data);
    String::from_utf8_lossy(body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIPART: &[u8] = b"From: a@example.com\n\
Subject: patch\n\
Message-ID: <m1@example.com>\n\
MIME-Version: 1.0\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\n\
\n\
--XYZ\n\
Content-Type: text/plain; charset=utf-8\n\
\n\
Here is the patch.\n\
--XYZ\n\
Content-Type: text/x-diff; name=\"fix.patch\"\n\
Content-Disposition: attachment; filename=\"fix.patch\"\n\
Content-Transfer-Encoding: base64\n\
\n\
ZGlmZiAtLWdpdAo=\n\
--XYZ--\n";

    #[test]
    fn test_plain_body() {
        let content = extract_content(b"Subject: hi\n\nHello there.\n");
        assert_eq!(content.body.trim(), "Hello there.");
        assert!(content.attachments.is_empty());
    }

    #[test]
    fn test_multipart_with_attachment() {
        let content = extract_content(MULTIPART);
        assert_eq!(content.body.trim(), "Here is the patch.");
        assert_eq!(content.attachments.len(), 1);
        let att = &content.attachments[0];
        assert_eq!(att.filename, "fix.patch");
        assert_eq!(att.content_type, "text/x-diff");
        assert_eq!(att.data, b"diff --git\n");
    }

    #[test]
    fn test_fallback_body() {
        assert_eq!(extract_body_fallback(b"A: b\n\nrest\xff\n"), "rest\u{fffd}\n");
        assert_eq!(extract_body_fallback(b"no body"), "");
    }
}

//! Parse one raw message into a [`ParsedMessage`].

use crate::model::address::EmailAddress;
use crate::model::message::{ParsedMessage, RawMessage};

use super::header::{self, HeaderMap};
use super::mime;

/// Parse a raw message. Never fails.
///
/// Missing or malformed headers leave their fields empty; deciding whether
/// that is acceptable is the analyzer's job.
pub fn parse(raw: &RawMessage) -> ParsedMessage {
    parse_bytes(&raw.bytes)
}

/// Parse a complete RFC 5322 message given as bytes.
pub fn parse_bytes(bytes: &[u8]) -> ParsedMessage {
    let (header_bytes, _) = header::split_message(bytes);
    let headers = HeaderMap::parse(header_bytes);

    let message_id = headers
        .get("message-id")
        .map(|v| {
            header::extract_ids(v)
                .into_iter()
                .next()
                .unwrap_or_else(|| header::normalize_id(v))
        })
        .filter(|id| !id.is_empty());

    let in_reply_to = headers
        .get("in-reply-to")
        .map(header::extract_ids)
        .unwrap_or_default();
    let references = headers
        .get("references")
        .map(header::extract_ids)
        .unwrap_or_default();
    let parent_id = header::canonical_parent(&in_reply_to, &references, message_id.as_deref());

    let date_header = headers.get("date").map(str::to_string);
    let date = date_header.as_deref().and_then(header::parse_date);

    let address_list = |name: &str| {
        headers
            .get_decoded(name)
            .map(|v| EmailAddress::parse_list(&v))
            .unwrap_or_default()
    };

    let content = mime::extract_content(bytes);

    ParsedMessage {
        message_id,
        in_reply_to,
        references,
        parent_id,
        date_header,
        date,
        subject: headers.get_decoded("subject").unwrap_or_default(),
        from: headers
            .get_decoded("from")
            .map(|v| EmailAddress::parse(&v))
            .unwrap_or_default(),
        to: address_list("to"),
        cc: address_list("cc"),
        list_id: headers.get("list-id").and_then(extract_list_id),
        body: content.body,
        attachments: content.attachments,
        raw: header::decode_lines(bytes),
    }
}

/// `"PostgreSQL Hackers <pgsql-hackers.postgresql.org>"` ⇒ `pgsql-hackers.postgresql.org`.
fn extract_list_id(value: &str) -> Option<String> {
    let id = header::extract_ids(value)
        .into_iter()
        .next()
        .unwrap_or_else(|| header::normalize_id(value));
    (!id.is_empty()).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply() {
        let msg = parse_bytes(
            b"From: \"Tom Lane\" <tgl@example.com>\n\
To: pgsql-hackers@example.com, Bruce <bruce@example.com>\n\
Subject: =?UTF-8?Q?Re:_caf=C3=A9?=\n\
Date: Thu, 04 Jan 2024 10:00:00 +0000\n\
Message-ID: <reply@example.com>\n\
In-Reply-To: <root@example.com>\n\
References: <older@example.com>\n\t<root@example.com>\n\
List-Id: PostgreSQL Hackers <pgsql-hackers.postgresql.org>\n\
\n\
Body text.\n",
        );
        assert_eq!(msg.message_id.as_deref(), Some("reply@example.com"));
        assert_eq!(msg.parent_id.as_deref(), Some("root@example.com"));
        assert_eq!(msg.references, vec!["older@example.com", "root@example.com"]);
        assert_eq!(msg.subject, "Re: café");
        assert_eq!(msg.from.display_name, "Tom Lane");
        assert_eq!(msg.to.len(), 2);
        assert!(msg.date.is_some());
        assert_eq!(msg.list_id.as_deref(), Some("pgsql-hackers.postgresql.org"));
        assert_eq!(msg.body.trim(), "Body text.");
    }

    #[test]
    fn test_mixed_header_encodings() {
        let msg = parse_bytes(
            b"Message-ID: <p@x>\nSubject: caf\xC3\xA9\nFrom: Ren\xE9 <rene@example.com>\nX-Mailer: Ren\xE9\n\nhi\n",
        );
        assert_eq!(msg.subject, "caf\u{e9}");
        assert_eq!(msg.from.display_name, "Ren\u{e9}");
    }

    #[test]
    fn test_raw_latin1_kept_readable() {
        let msg = parse_bytes(b"Message-ID: <l@x>\nSubject: caf\xE9\n\nna\xEFve body\n");
        assert_eq!(msg.subject, "caf\u{e9}");
        assert!(msg.raw.contains("na\u{ef}ve body"));
        assert!(!msg.raw.contains('\u{fffd}'));
    }

    #[test]
    fn test_parent_from_references_only() {
        let msg = parse_bytes(
            b"Message-ID: <c@x>\nReferences: <a@x> <b@x>\nIn-Reply-To: your message of Tuesday\n\nhi\n",
        );
        assert!(msg.in_reply_to.is_empty());
        assert_eq!(msg.parent_id.as_deref(), Some("b@x"));
    }

    #[test]
    fn test_missing_headers_degrade() {
        let msg = parse_bytes(b"this is not really an email\n");
        assert!(msg.message_id.is_none());
        assert!(msg.parent_id.is_none());
        assert!(msg.date.is_none());
        assert!(msg.subject.is_empty());
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn test_bad_date_is_reported_not_dropped() {
        let msg = parse_bytes(b"Message-ID: <d@x>\nDate: not a date\n\nbody\n");
        assert_eq!(msg.date_header.as_deref(), Some("not a date"));
        assert!(msg.date.is_none());
    }

    #[test]
    fn test_undecodable_bytes_are_replaced() {
        let msg = parse_bytes(b"Message-ID: <e@x>\nSubject: ok\n\nbad \xff byte\n");
        assert!(msg.raw.contains('\u{fffd}'));
        assert_eq!(msg.message_id.as_deref(), Some("e@x"));
    }
}

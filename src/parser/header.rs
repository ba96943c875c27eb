//! RFC 5322 header handling: folding, encoded-words (RFC 2047), ids and dates.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use mail_parser::MessageParser;
use tracing::debug;

/// Unfolded headers of one message, in source order.
///
/// Names are lowercased; values are raw (encoded-words not yet decoded).
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Decode and unfold a raw header block.
    pub fn parse(raw_headers: &[u8]) -> Self {
        Self {
            entries: unfold_headers(&decode_header_bytes(raw_headers)),
        }
    }

    /// First value of a header (case-insensitive name).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value with RFC 2047 encoded-words decoded.
    pub fn get_decoded(&self, name: &str) -> Option<String> {
        self.get(name).map(decode_encoded_words)
    }

    /// Number of header lines (after unfolding).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split a message into its header block and body at the first blank line.
///
/// A message without a blank line is all headers.
pub fn split_message(data: &[u8]) -> (&[u8], &[u8]) {
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\n' {
            if data.get(i + 1) == Some(&b'\n') {
                return (&data[..i + 1], &data[i + 2..]);
            }
            if data.get(i + 1) == Some(&b'\r') && data.get(i + 2) == Some(&b'\n') {
                return (&data[..i + 1], &data[i + 3..]);
            }
        }
        i += 1;
    }
    (data, &[])
}

/// Decode raw header bytes to text, skipping a leading BOM.
fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    decode_lines(bytes)
}

/// Decode 8-bit mail text line by line.
///
/// Each line is UTF-8 when valid, otherwise Windows-1252, which maps every
/// byte. One Latin-1 line never drags its UTF-8 neighbours down with it.
pub fn decode_lines(bytes: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }
    let mut out = String::with_capacity(bytes.len() + bytes.len() / 8);
    for line in bytes.split_inclusive(|&b| b == b'\n') {
        match std::str::from_utf8(line) {
            Ok(s) => out.push_str(s),
            Err(_) => out.push_str(&encoding_rs::WINDOWS_1252.decode_without_bom_handling(line).0),
        }
    }
    out
}

/// Join continuation lines onto their header and lowercase the names.
fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon) = line.find(':') {
            let name = line[..colon].trim();
            // Skip mbox "From " lines and other junk with spaces in the name
            if name.is_empty() || name.contains(' ') {
                continue;
            }
            result.push((name.to_lowercase(), line[colon + 1..].trim().to_string()));
        }
    }

    result
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// `mail-parser` does the charset work; text it cannot make sense of comes
/// back unchanged.
pub fn decode_encoded_words(input: &str) -> String {
    if !input.contains("=?") {
        return input.to_string();
    }
    let fake_msg = format!("Subject: {input}\n\n");
    MessageParser::default()
        .parse(fake_msg.as_bytes())
        .and_then(|m| m.subject().map(str::to_string))
        .unwrap_or_else(|| input.to_string())
}

/// Strip whitespace and angle brackets from a bare id.
pub fn normalize_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// All `<…>` ids in a header value, normalized, in order.
///
/// Values without any brackets are treated as a single bare id when they
/// look like one (`local@domain`, no whitespace).
pub fn extract_ids(value: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut remaining = value;
    while let Some(start) = remaining.find('<') {
        let Some(len) = remaining[start..].find('>') else {
            break;
        };
        let id = normalize_id(&remaining[start..start + len + 1]);
        if !id.is_empty() {
            ids.push(id);
        }
        remaining = &remaining[start + len + 1..];
    }

    if ids.is_empty() {
        let bare = value.trim();
        if bare.contains('@') && !bare.contains(char::is_whitespace) {
            ids.push(normalize_id(bare));
        }
    }
    ids
}

/// Pick the canonical parent id: first usable `In-Reply-To` id, else the
/// last `References` id, else none. An id equal to `own_id` is unusable.
pub fn canonical_parent(
    in_reply_to: &[String],
    references: &[String],
    own_id: Option<&str>,
) -> Option<String> {
    let usable = |id: &&String| Some(id.as_str()) != own_id;
    in_reply_to
        .iter()
        .find(usable)
        .or_else(|| references.iter().rev().find(usable))
        .cloned()
}

/// Parse an email date in the formats seen on real lists.
///
/// RFC 2822 first, then ISO 8601, then a set of broken variants.
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let trimmed = strip_trailing_comment(date_str.trim());
    if !trimmed.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let no_dow = strip_day_of_week(trimmed);
    let candidates = [no_dow.to_string(), replace_named_tz(no_dow)];

    const FORMATS: [&str; 8] = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M %z",
        "%d %b %Y %H:%M:%S",
        "%b %d %H:%M:%S %Y",
        "%Y-%m-%d %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
    ];

    for candidate in &candidates {
        for fmt in FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(candidate, fmt) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(ndt) = NaiveDateTime::parse_from_str(candidate, fmt) {
                return Some(Utc.from_utc_datetime(&ndt));
            }
        }
    }

    if let Some(dt) = mail_parser_date(trimmed) {
        return Some(dt);
    }

    debug!(date = trimmed, "Could not parse date");
    None
}

/// Last resort: let `mail-parser` try.
fn mail_parser_date(input: &str) -> Option<DateTime<Utc>> {
    let fake_msg = format!("Date: {input}\n\n");
    let parsed = MessageParser::default().parse(fake_msg.as_bytes())?;
    let dt = parsed.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&dt)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Drop a trailing `(PST)`-style comment.
fn strip_trailing_comment(s: &str) -> &str {
    if s.ends_with(')') {
        if let Some(open) = s.rfind('(') {
            return s[..open].trim_end();
        }
    }
    s
}

fn strip_day_of_week(s: &str) -> &str {
    const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    for day in DAYS {
        if let Some(rest) = s.strip_prefix(day) {
            return rest.trim_start_matches(',').trim_start();
        }
    }
    s
}

/// Replace a trailing timezone abbreviation with its numeric offset.
fn replace_named_tz(s: &str) -> String {
    const TZS: [(&str, &str); 13] = [
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("MST", "-0700"),
        ("MDT", "-0600"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("GMT", "+0000"),
        ("UTC", "+0000"),
        ("CEST", "+0200"),
        ("CET", "+0100"),
        ("JST", "+0900"),
    ];
    for (name, offset) in TZS {
        if let Some(head) = s.strip_suffix(name) {
            return format!("{head}{offset}");
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfold_and_lookup() {
        let headers = HeaderMap::parse(
            b"Subject: This is a long\n\tsubject line\nFROM: user@example.com\n",
        );
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("subject"), Some("This is a long subject line"));
        assert_eq!(headers.get("From"), Some("user@example.com"));
    }

    #[test]
    fn test_unfold_skips_mbox_separator() {
        let headers =
            HeaderMap::parse(b"From someone@x.org Thu Jan  1 00:00:00 2024\nSubject: Hi\n");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("subject"), Some("Hi"));
    }

    #[test]
    fn test_latin1_header_bytes() {
        let headers = HeaderMap::parse(b"Subject: caf\xe9\n");
        assert_eq!(headers.get("subject"), Some("café"));
    }

    #[test]
    fn test_split_message() {
        let (h, b) = split_message(b"A: 1\nB: 2\n\nbody\n");
        assert_eq!(h, b"A: 1\nB: 2\n");
        assert_eq!(b, b"body\n");

        let (h, b) = split_message(b"A: 1\r\n\r\nbody\r\n");
        assert_eq!(h, b"A: 1\r\n");
        assert_eq!(b, b"body\r\n");

        let (h, b) = split_message(b"A: 1\n");
        assert_eq!(h, b"A: 1\n");
        assert!(b.is_empty());
    }

    #[test]
    fn test_decode_encoded_words() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?SG9sYSBtdW5kbw==?="), "Hola mundo");
        assert_eq!(decode_encoded_words("=?ISO-8859-1?Q?caf=E9?="), "café");
        assert_eq!(decode_encoded_words("Plain subject"), "Plain subject");
    }

    #[test]
    fn test_extract_ids() {
        assert_eq!(
            extract_ids("<a@b.com> <c@d.com>\t<e@f.com>"),
            vec!["a@b.com", "c@d.com", "e@f.com"]
        );
        assert_eq!(
            extract_ids("<x@y.org> (Tom Lane's message of Thu)"),
            vec!["x@y.org"]
        );
        assert_eq!(extract_ids("bare@id.org"), vec!["bare@id.org"]);
        assert!(extract_ids("Your message of yesterday").is_empty());
        assert!(extract_ids("<>").is_empty());
    }

    #[test]
    fn test_canonical_parent_priority() {
        let irt = vec!["p@x".to_string()];
        let refs = vec!["r1@x".to_string(), "r2@x".to_string()];
        assert_eq!(canonical_parent(&irt, &refs, None).as_deref(), Some("p@x"));
        assert_eq!(canonical_parent(&[], &refs, None).as_deref(), Some("r2@x"));
        assert_eq!(canonical_parent(&[], &[], None), None);
    }

    #[test]
    fn test_canonical_parent_skips_self_reference() {
        let irt = vec!["me@x".to_string()];
        let refs = vec!["root@x".to_string(), "me@x".to_string()];
        assert_eq!(
            canonical_parent(&irt, &refs, Some("me@x")).as_deref(),
            Some("root@x")
        );
    }

    #[test]
    fn test_parse_date_variants() {
        let dt = parse_date("Thu, 04 Jan 2024 10:00:00 +0000").unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M").to_string(), "2024-01-04 10:00");

        assert!(parse_date("04 Jan 2024 10:00:00 +0000").is_some());
        assert!(parse_date("2024-01-04T10:00:00Z").is_some());

        let est = parse_date("Thu, 04 Jan 2024 10:00:00 EST").unwrap();
        assert_eq!(est.format("%H").to_string(), "15");

        let commented = parse_date("Thu, 04 Jan 2024 10:00:00 -0800 (PST)").unwrap();
        assert_eq!(commented.format("%H").to_string(), "18");
    }

    #[test]
    fn test_parse_date_garbage() {
        assert!(parse_date("").is_none());
        assert!(parse_date("sometime last week").is_none());
    }
}

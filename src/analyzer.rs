//! Validation and failure classification.
//!
//! The analyzer turns a [`ParsedMessage`] into a [`Decision`]. It never aborts
//! a run by itself: it only says whether a message may be stored, should be
//! skipped and logged, or proves the source unusable.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::address::EmailAddress;
use crate::model::attachment::Attachment;
use crate::model::message::ParsedMessage;
use crate::source::SourceError;

/// A message that passed validation. Required fields are no longer optional.
#[derive(Debug, Clone)]
pub struct AcceptedMessage {
    pub message_id: String,
    pub parent_id: Option<String>,
    pub date: DateTime<Utc>,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub raw: String,
}

/// Why a message was skipped. The `Display` text is what lands in `loaderrors.err`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    #[error("Message-ID header missing")]
    MissingMessageId,

    #[error("Date header missing")]
    MissingDate,

    #[error("invalid date '{0}'")]
    InvalidDate(String),

    #[error("target list mismatch: message is for '{found}', expected '{expected}'")]
    ListMismatch { expected: String, found: String },

    #[error("duplicate Message-ID {0} in this run")]
    DuplicateInRun(String),

    #[error("Message-ID {0} already archived")]
    AlreadyArchived(String),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: u64, limit: u64 },
}

/// Outcome of analyzing one message.
#[derive(Debug)]
pub enum Decision {
    /// Store it.
    Proceed(Box<AcceptedMessage>),
    /// Skip it, record a load error, keep going.
    Ignore(IgnoreReason),
    /// Abort the whole run.
    Fatal(String),
}

/// Per-run analyzer state.
///
/// Holds the set of message ids accepted so far; ingestion is single-threaded
/// per run, so no locking is needed.
#[derive(Debug)]
pub struct Analyzer {
    list_name: String,
    check_list_id: bool,
    seen: HashSet<String>,
}

impl Analyzer {
    pub fn new(list_name: impl Into<String>, check_list_id: bool) -> Self {
        Self {
            list_name: list_name.into(),
            check_list_id,
            seen: HashSet::new(),
        }
    }

    /// Validate and normalize a parsed message.
    pub fn analyze(&mut self, parsed: ParsedMessage) -> Decision {
        let Some(message_id) = parsed.message_id else {
            return Decision::Ignore(IgnoreReason::MissingMessageId);
        };

        let date = match (parsed.date, parsed.date_header) {
            (Some(date), _) => date,
            (None, Some(raw)) => return Decision::Ignore(IgnoreReason::InvalidDate(raw)),
            (None, None) => return Decision::Ignore(IgnoreReason::MissingDate),
        };

        if self.check_list_id {
            if let Some(list_id) = parsed.list_id.as_deref() {
                if !list_id_matches(list_id, &self.list_name) {
                    return Decision::Ignore(IgnoreReason::ListMismatch {
                        expected: self.list_name.clone(),
                        found: list_id.to_string(),
                    });
                }
            }
        }

        if !self.seen.insert(message_id.clone()) {
            return Decision::Ignore(IgnoreReason::DuplicateInRun(message_id));
        }

        Decision::Proceed(Box::new(AcceptedMessage {
            parent_id: parsed.parent_id.filter(|p| *p != message_id),
            message_id,
            date,
            subject: parsed.subject.trim().to_string(),
            from: parsed.from.display(),
            to: EmailAddress::join(&parsed.to),
            cc: EmailAddress::join(&parsed.cc),
            body: parsed.body,
            attachments: parsed.attachments,
            raw: parsed.raw,
        }))
    }

    /// Number of distinct message ids accepted in this run.
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

/// Classify an entry the source could not produce.
pub fn classify_source_error(err: &SourceError) -> Decision {
    match err {
        SourceError::Io { .. } => Decision::Fatal(err.to_string()),
        SourceError::Oversized { size, limit, .. } => Decision::Ignore(IgnoreReason::Oversized {
            size: *size,
            limit: *limit,
        }),
    }
}

/// `pgsql-hackers.postgresql.org` matches list `pgsql-hackers`.
fn list_id_matches(list_id: &str, list_name: &str) -> bool {
    list_id.eq_ignore_ascii_case(list_name)
        || list_id
            .split('.')
            .next()
            .is_some_and(|label| label.eq_ignore_ascii_case(list_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::SourceKind;
    use chrono::TimeZone;

    fn parsed(id: Option<&str>) -> ParsedMessage {
        ParsedMessage {
            message_id: id.map(String::from),
            date_header: Some("Mon, 01 Jan 2024 10:00:00 +0000".into()),
            date: Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()),
            subject: "  Hello ".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_proceed_normalizes() {
        let mut analyzer = Analyzer::new("hackers", true);
        let Decision::Proceed(msg) = analyzer.analyze(parsed(Some("a@x"))) else {
            panic!("expected Proceed");
        };
        assert_eq!(msg.message_id, "a@x");
        assert_eq!(msg.subject, "Hello");
        assert_eq!(analyzer.seen_count(), 1);
    }

    #[test]
    fn test_missing_message_id() {
        let mut analyzer = Analyzer::new("hackers", true);
        assert!(matches!(
            analyzer.analyze(parsed(None)),
            Decision::Ignore(IgnoreReason::MissingMessageId)
        ));
    }

    #[test]
    fn test_invalid_and_missing_date() {
        let mut analyzer = Analyzer::new("hackers", true);
        let mut bad = parsed(Some("a@x"));
        bad.date = None;
        bad.date_header = Some("yesterday".into());
        assert_eq!(
            match analyzer.analyze(bad) {
                Decision::Ignore(r) => r,
                other => panic!("unexpected {other:?}"),
            },
            IgnoreReason::InvalidDate("yesterday".into())
        );

        let mut none = parsed(Some("b@x"));
        none.date = None;
        none.date_header = None;
        assert!(matches!(
            analyzer.analyze(none),
            Decision::Ignore(IgnoreReason::MissingDate)
        ));
    }

    #[test]
    fn test_duplicate_in_run() {
        let mut analyzer = Analyzer::new("hackers", true);
        assert!(matches!(analyzer.analyze(parsed(Some("a@x"))), Decision::Proceed(_)));
        assert!(matches!(
            analyzer.analyze(parsed(Some("a@x"))),
            Decision::Ignore(IgnoreReason::DuplicateInRun(_))
        ));
    }

    #[test]
    fn test_list_id_check() {
        let mut analyzer = Analyzer::new("pgsql-hackers", true);
        let mut ok = parsed(Some("a@x"));
        ok.list_id = Some("pgsql-hackers.postgresql.org".into());
        assert!(matches!(analyzer.analyze(ok), Decision::Proceed(_)));

        let mut wrong = parsed(Some("b@x"));
        wrong.list_id = Some("pgsql-general.postgresql.org".into());
        assert!(matches!(
            analyzer.analyze(wrong),
            Decision::Ignore(IgnoreReason::ListMismatch { .. })
        ));

        let mut unchecked = Analyzer::new("pgsql-hackers", false);
        let mut other = parsed(Some("c@x"));
        other.list_id = Some("pgsql-general.postgresql.org".into());
        assert!(matches!(unchecked.analyze(other), Decision::Proceed(_)));
    }

    #[test]
    fn test_self_parent_dropped() {
        let mut analyzer = Analyzer::new("l", false);
        let mut msg = parsed(Some("a@x"));
        msg.parent_id = Some("a@x".into());
        let Decision::Proceed(accepted) = analyzer.analyze(msg) else {
            panic!("expected Proceed");
        };
        assert!(accepted.parent_id.is_none());
    }

    #[test]
    fn test_source_error_classification() {
        let io = SourceError::Io {
            kind: SourceKind::Directory,
            locator: "/tmp/x".into(),
            source: std::io::Error::other("disk on fire"),
        };
        assert!(matches!(classify_source_error(&io), Decision::Fatal(_)));

        let big = SourceError::Oversized {
            kind: SourceKind::Mbox,
            locator: "/tmp/x:0".into(),
            size: 10,
            limit: 5,
        };
        assert!(matches!(
            classify_source_error(&big),
            Decision::Ignore(IgnoreReason::Oversized { size: 10, limit: 5 })
        ));
    }
}

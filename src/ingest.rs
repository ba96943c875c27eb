//! Ingestion run: source → parser → analyzer → store.
//!
//! A batch run shares one write session and commits once at the end. In
//! interactive mode every message is committed on its own before the
//! operator is asked whether to continue, so stopping keeps everything
//! loaded so far and never leaves a transaction open while waiting.

use std::io::{BufRead, Write};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::analyzer::{classify_source_error, Analyzer, Decision, IgnoreReason};
use crate::config::IngestConfig;
use crate::error::{ArchiveError, Result};
use crate::model::message::SourceKind;
use crate::parser;
use crate::source::MessageSource;
use crate::store::{ListId, LoadErrorEntry, Session, Store, StoreOutcome};

/// Message id recorded for load errors when none could be read.
pub const UNKNOWN_MSGID: &str = "<unknown>";

/// Tallies of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Messages stored.
    pub processed: usize,
    /// Messages skipped and recorded as load errors.
    pub skipped: usize,
    /// Fatal failures (at most one, which ends the run).
    pub failed: usize,
    /// Messages moved between threads when orphans found their parent.
    pub merged: usize,
    /// Raw size of the stored messages.
    pub bytes: u64,
    /// The operator stopped an interactive run early.
    pub aborted: bool,
}

/// Asks whether an interactive run should go on after a committed message.
pub trait Confirm {
    /// `Ok(false)` stops the run.
    fn proceed(&mut self) -> std::io::Result<bool>;
}

/// Terminal prompt: Enter continues, a single `.` (or end of input) stops.
pub struct PromptConfirm<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptConfirm<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Confirm for PromptConfirm<R, W> {
    fn proceed(&mut self) -> std::io::Result<bool> {
        writeln!(
            self.output,
            "Proceed to next message with Enter, or input a period (.) to stop processing"
        )?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 || line.trim() == "." {
            writeln!(self.output, "Ok, stopping.")?;
            return Ok(false);
        }
        writeln!(self.output, "---------------------------------")?;
        Ok(true)
    }
}

/// Loads messages into one list of an archive.
pub struct Ingestor<'s> {
    store: &'s Store,
    list: ListId,
    analyzer: Analyzer,
}

impl<'s> Ingestor<'s> {
    /// Resolve the target list; an unknown list ends the run before it starts.
    pub fn new(store: &'s Store, list_name: &str, config: &IngestConfig) -> Result<Self> {
        let list = store.resolve_list(list_name)?;
        Ok(Self {
            store,
            list,
            analyzer: Analyzer::new(list_name, config.check_list_id),
        })
    }

    /// Drain `source` into the archive.
    ///
    /// Per-message problems are recorded and counted; the first fatal one
    /// rolls back the uncommitted part of the run and is returned as `Err`.
    /// `progress` is called after every message.
    pub fn run(
        &mut self,
        source: MessageSource,
        mut confirm: Option<&mut dyn Confirm>,
        progress: Option<&dyn Fn(&RunSummary)>,
    ) -> Result<RunSummary> {
        let store = self.store;
        let mut summary = RunSummary::default();
        let mut committed = RunSummary::default();
        let mut session = store.begin()?;

        info!(
            list = self.list,
            source = %source.kind(),
            messages = source.remaining(),
            "Starting load"
        );

        for item in source {
            let (decision, msgid, kind, locator, size) = match item {
                Ok(raw) => {
                    debug!(source = %raw.kind, locator = %raw.locator, "Parsing message");
                    let parsed = parser::parse(&raw);
                    let msgid = parsed.message_id.clone();
                    let size = raw.bytes.len() as u64;
                    (self.analyzer.analyze(parsed), msgid, raw.kind, raw.locator, size)
                }
                Err(err) => (
                    classify_source_error(&err),
                    None,
                    err.kind(),
                    err.locator().to_string(),
                    0,
                ),
            };
            let msgid = msgid.as_deref().unwrap_or(UNKNOWN_MSGID);
            let processed_before = summary.processed;

            match decision {
                Decision::Proceed(msg) => match session.store_message(&msg, self.list)? {
                    StoreOutcome::Stored {
                        id,
                        thread_id,
                        merged,
                    } => {
                        info!(msgid, id, thread_id, merged, "Stored message");
                        summary.processed += 1;
                        summary.merged += merged;
                        summary.bytes += size;
                    }
                    StoreOutcome::Duplicate => {
                        let reason = IgnoreReason::AlreadyArchived(msg.message_id.clone());
                        self.skip(&session, &mut summary, msgid, kind, &locator, &reason)?;
                    }
                },
                Decision::Ignore(reason) => {
                    self.skip(&session, &mut summary, msgid, kind, &locator, &reason)?;
                }
                Decision::Fatal(reason) => {
                    error!(source = %kind, locator = %locator, error = %reason, "Aborting load");
                    session.rollback()?;
                    // Only what reached a commit survives
                    let mut summary = committed;
                    summary.failed = 1;
                    return Err(ArchiveError::Aborted {
                        reason,
                        summary: Box::new(summary),
                    });
                }
            }

            if let Some(progress) = progress {
                progress(&summary);
            }

            // Skipped messages ride along with the next commit
            if summary.processed == processed_before {
                continue;
            }

            if let Some(confirm) = confirm.as_deref_mut() {
                info!("Interactive mode, committing transaction");
                session.commit()?;
                committed = summary.clone();
                let go_on = confirm
                    .proceed()
                    .map_err(|e| ArchiveError::io("<stdin>", e))?;
                if !go_on {
                    info!(processed = summary.processed, "Load stopped by operator");
                    summary.aborted = true;
                    return Ok(summary);
                }
                session = store.begin()?;
            }
        }

        info!("Committing");
        session.commit()?;
        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            merged = summary.merged,
            "Load done"
        );
        Ok(summary)
    }

    fn skip(
        &self,
        session: &Session<'_>,
        summary: &mut RunSummary,
        msgid: &str,
        kind: SourceKind,
        locator: &str,
        reason: &IgnoreReason,
    ) -> Result<()> {
        warn!(msgid, source = %kind, locator, error = %reason, "Failed to load message");
        session.record_load_error(&LoadErrorEntry {
            list: self.list,
            message_id: msgid,
            kind,
            locator,
            error: &reason.to_string(),
        })?;
        summary.skipped += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, parent: Option<&str>) -> String {
        let mut text = format!(
            "From: Someone <someone@example.com>\nSubject: {id}\nDate: Mon, 01 Jan 2024 10:00:00 +0000\nMessage-ID: <{id}>\n"
        );
        if let Some(parent) = parent {
            text.push_str(&format!("In-Reply-To: <{parent}>\n"));
        }
        text.push_str("\nbody\n");
        text
    }

    fn setup() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.create_list("hackers", "dev", None).unwrap();
        store
    }

    struct Scripted(Vec<bool>);

    impl Confirm for Scripted {
        fn proceed(&mut self) -> std::io::Result<bool> {
            Ok(if self.0.is_empty() { false } else { self.0.remove(0) })
        }
    }

    fn write_dir(messages: &[String]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (i, m) in messages.iter().enumerate() {
            std::fs::write(dir.path().join(format!("{i:03}.eml")), m).unwrap();
        }
        dir
    }

    #[test]
    fn test_unknown_list() {
        let store = Store::open_in_memory().unwrap();
        let err = Ingestor::new(&store, "nope", &IngestConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, ArchiveError::ListNotFound(_)));
    }

    #[test]
    fn test_single_message_from_reader() {
        let store = setup();
        let mut ingestor = Ingestor::new(&store, "hackers", &IngestConfig::default()).unwrap();
        let source = MessageSource::from_reader(message("a@x", None).as_bytes()).unwrap();
        let summary = ingestor.run(source, None, None).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(store.message_count().unwrap(), 1);
    }

    #[test]
    fn test_stdin_ignorable_failure_is_recorded() {
        let store = setup();
        let mut ingestor = Ingestor::new(&store, "hackers", &IngestConfig::default()).unwrap();
        let source = MessageSource::from_reader(&b"Subject: no id\n\nbody\n"[..]).unwrap();
        let summary = ingestor.run(source, None, None).unwrap();
        assert_eq!(summary.skipped, 1);
        let errors = store.load_errors(None).unwrap();
        assert_eq!(errors[0].message_id, UNKNOWN_MSGID);
        assert_eq!(errors[0].source_type, "stdin");
        assert_eq!(errors[0].source, "");
    }

    #[test]
    fn test_already_archived_is_skipped() {
        let store = setup();
        for _ in 0..2 {
            let mut ingestor =
                Ingestor::new(&store, "hackers", &IngestConfig::default()).unwrap();
            let source = MessageSource::from_reader(message("a@x", None).as_bytes()).unwrap();
            ingestor.run(source, None, None).unwrap();
        }
        assert_eq!(store.message_count().unwrap(), 1);
        let errors = store.load_errors(None).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].error.contains("already archived"));
    }

    #[test]
    fn test_interactive_stop_keeps_committed() {
        let store = setup();
        let dir = write_dir(&[
            message("a@x", None),
            message("b@x", None),
            message("c@x", None),
        ]);
        let mut ingestor = Ingestor::new(&store, "hackers", &IngestConfig::default()).unwrap();
        let source = MessageSource::directory(dir.path(), 1 << 20).unwrap();
        let mut confirm = Scripted(vec![true, false]);
        let summary = ingestor.run(source, Some(&mut confirm), None).unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.processed, 2);
        assert_eq!(store.message_count().unwrap(), 2);
        assert!(store.message("c@x").unwrap().is_none());
    }

    #[test]
    fn test_fatal_source_error_rolls_back() {
        let store = setup();
        let dir = write_dir(&[message("a@x", None), message("b@x", None)]);
        let source = MessageSource::directory(dir.path(), 1 << 20).unwrap();
        // Vanishes between listing and reading
        std::fs::remove_file(dir.path().join("001.eml")).unwrap();

        let mut ingestor = Ingestor::new(&store, "hackers", &IngestConfig::default()).unwrap();
        let err = ingestor.run(source, None, None).unwrap_err();
        let (reason, summary) = match err {
            ArchiveError::Aborted { reason, summary } => (reason, summary),
            other => panic!("expected an aborted run, got {other:?}"),
        };
        assert!(reason.contains("001.eml"));
        assert_eq!(
            *summary,
            RunSummary {
                failed: 1,
                ..RunSummary::default()
            }
        );
        assert_eq!(store.message_count().unwrap(), 0);
        assert_eq!(store.load_error_count().unwrap(), 0);
    }

    /// Deletes a file the first time it is asked, then keeps going.
    struct RemoveOnConfirm(std::path::PathBuf);

    impl Confirm for RemoveOnConfirm {
        fn proceed(&mut self) -> std::io::Result<bool> {
            if self.0.exists() {
                std::fs::remove_file(&self.0)?;
            }
            Ok(true)
        }
    }

    #[test]
    fn test_fatal_error_reports_committed_tallies() {
        let store = setup();
        let dir = write_dir(&[
            message("a@x", None),
            "Subject: no id\n\nbody\n".to_string(),
            message("b@x", None),
            message("c@x", None),
        ]);
        let source = MessageSource::directory(dir.path(), 1 << 20).unwrap();
        let mut confirm = RemoveOnConfirm(dir.path().join("002.eml"));

        let mut ingestor = Ingestor::new(&store, "hackers", &IngestConfig::default()).unwrap();
        let err = ingestor.run(source, Some(&mut confirm), None).unwrap_err();
        let summary = match err {
            ArchiveError::Aborted { summary, .. } => summary,
            other => panic!("expected an aborted run, got {other:?}"),
        };

        // a@x was committed; the skip after it was not
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.failed, 1);
        assert!(!summary.aborted);
        assert_eq!(store.message_count().unwrap(), 1);
        assert_eq!(store.load_error_count().unwrap(), 0);
    }

    #[test]
    fn test_interactive_prompts_only_after_stored_messages() {
        let store = setup();
        let dir = write_dir(&[
            message("a@x", None),
            "Subject: no id\n\nbody\n".to_string(),
            message("b@x", None),
        ]);
        let source = MessageSource::directory(dir.path(), 1 << 20).unwrap();
        let mut confirm = Scripted(vec![true, true, true]);

        let mut ingestor = Ingestor::new(&store, "hackers", &IngestConfig::default()).unwrap();
        let summary = ingestor.run(source, Some(&mut confirm), None).unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(confirm.0.len(), 1);
        assert_eq!(store.load_error_count().unwrap(), 1);
    }

    #[test]
    fn test_progress_called_per_message() {
        let store = setup();
        let dir = write_dir(&[message("a@x", None), message("b@x", Some("a@x"))]);
        let source = MessageSource::directory(dir.path(), 1 << 20).unwrap();
        let calls = std::cell::Cell::new(0);
        let progress = |_: &RunSummary| calls.set(calls.get() + 1);
        let mut ingestor = Ingestor::new(&store, "hackers", &IngestConfig::default()).unwrap();
        ingestor.run(source, None, Some(&progress)).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_prompt_confirm() {
        let mut out = Vec::new();
        assert!(PromptConfirm::new(&b"\n"[..], &mut out).proceed().unwrap());
        assert!(!PromptConfirm::new(&b".\n"[..], &mut out).proceed().unwrap());
        assert!(!PromptConfirm::new(&b""[..], &mut out).proceed().unwrap());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("input a period (.) to stop processing"));
    }
}

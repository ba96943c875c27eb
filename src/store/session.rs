//! Write session: one transaction covering the messages of a run (or, in
//! interactive mode, of a single message).

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use tracing::{debug, info, warn};

use crate::analyzer::AcceptedMessage;
use crate::error::Result;
use crate::model::message::SourceKind;

use super::{ListId, ThreadId};

/// Result of [`Session::store_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored {
        id: i64,
        thread_id: ThreadId,
        /// Messages moved into this thread by re-parenting orphans.
        merged: usize,
    },
    /// The Message-ID is already archived; nothing was written.
    Duplicate,
}

/// One skipped message, as recorded in `loaderrors`.
#[derive(Debug, Clone, Copy)]
pub struct LoadErrorEntry<'a> {
    pub list: ListId,
    /// Best-effort Message-ID, `<unknown>` when none could be read.
    pub message_id: &'a str,
    pub kind: SourceKind,
    pub locator: &'a str,
    pub error: &'a str,
}

/// An open write transaction. Dropped without [`Session::commit`], it rolls back.
pub struct Session<'c> {
    tx: Transaction<'c>,
}

impl<'c> Session<'c> {
    pub(super) fn new(tx: Transaction<'c>) -> Self {
        Self { tx }
    }

    /// Persist a message, its attachments and its list membership.
    ///
    /// The thread is inherited from the parent when the parent is archived,
    /// otherwise a new one is allocated. Orphans already waiting for this
    /// message are re-parented onto it and their subtrees moved into its
    /// thread.
    pub fn store_message(&self, msg: &AcceptedMessage, list: ListId) -> Result<StoreOutcome> {
        let exists = self
            .tx
            .query_row(
                "SELECT 1 FROM messages WHERE messageid = ?1",
                [&msg.message_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(StoreOutcome::Duplicate);
        }

        let parent: Option<(i64, ThreadId)> = match &msg.parent_id {
            Some(parent_id) => self
                .tx
                .query_row(
                    "SELECT id, threadid FROM messages WHERE messageid = ?1",
                    [parent_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
            None => None,
        };

        let thread_id = match parent {
            Some((_, thread_id)) => thread_id,
            None => {
                if let Some(parent_id) = &msg.parent_id {
                    debug!(msgid = %msg.message_id, parent = %parent_id, "Parent not archived yet, storing as orphan");
                }
                self.allocate_thread()?
            }
        };

        self.tx.execute(
            "INSERT INTO messages \
               (messageid, threadid, parentid, parent_messageid, _from, _to, cc, \
                subject, date, body, has_attachment, rawtxt) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                msg.message_id,
                thread_id,
                parent.map(|(id, _)| id),
                msg.parent_id,
                msg.from,
                msg.to,
                msg.cc,
                msg.subject,
                msg.date,
                msg.body,
                !msg.attachments.is_empty(),
                msg.raw,
            ],
        )?;
        let id = self.tx.last_insert_rowid();

        for attachment in &msg.attachments {
            self.tx.execute(
                "INSERT INTO attachments (message, filename, contenttype, attachment) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, attachment.filename, attachment.content_type, attachment.data],
            )?;
        }

        self.tx.execute(
            "INSERT OR IGNORE INTO list_threads (listid, threadid) VALUES (?1, ?2)",
            params![list, thread_id],
        )?;

        let merged = self.adopt_orphans(id, &msg.message_id, thread_id)?;

        Ok(StoreOutcome::Stored {
            id,
            thread_id,
            merged,
        })
    }

    /// Record a skipped message in the same transaction as the stored ones.
    pub fn record_load_error(&self, entry: &LoadErrorEntry<'_>) -> Result<()> {
        self.tx.execute(
            "INSERT INTO loaderrors (listid, dat, msgid, srctype, src, err) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.list,
                Utc::now(),
                entry.message_id,
                entry.kind.as_str(),
                entry.locator,
                entry.error,
            ],
        )?;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }

    fn allocate_thread(&self) -> Result<ThreadId> {
        self.tx
            .execute("INSERT INTO threadid_seq DEFAULT VALUES", ())?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Link every orphan that declared `message_id` as its parent to the
    /// message `id`, merging the orphans' threads into `thread_id`.
    ///
    /// Returns the number of messages whose thread changed.
    fn adopt_orphans(&self, id: i64, message_id: &str, thread_id: ThreadId) -> Result<usize> {
        let orphans: Vec<(i64, ThreadId)> = {
            let mut stmt = self.tx.prepare(
                "SELECT id, threadid FROM messages \
                 WHERE parentid IS NULL AND parent_messageid = ?1 AND id <> ?2",
            )?;
            let rows = stmt
                .query_map(params![message_id, id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut merged = 0;
        for (orphan, old_thread) in orphans {
            if old_thread == thread_id {
                // The orphan is an ancestor of the new message already
                warn!(msgid = %message_id, orphan, "Not re-parenting orphan, link would form a cycle");
                continue;
            }

            self.tx.execute(
                "UPDATE messages SET parentid = ?1 WHERE id = ?2",
                params![id, orphan],
            )?;
            let moved = self.move_subtree(orphan, thread_id)?;

            self.tx.execute(
                "INSERT OR IGNORE INTO list_threads (listid, threadid) \
                 SELECT listid, ?1 FROM list_threads WHERE threadid = ?2",
                params![thread_id, old_thread],
            )?;
            let remaining: i64 = self.tx.query_row(
                "SELECT COUNT(*) FROM messages WHERE threadid = ?1",
                [old_thread],
                |row| row.get(0),
            )?;
            if remaining == 0 {
                self.tx
                    .execute("DELETE FROM list_threads WHERE threadid = ?1", [old_thread])?;
            }

            info!(
                msgid = %message_id,
                orphan,
                from_thread = old_thread,
                to_thread = thread_id,
                moved,
                "Merged orphaned thread"
            );
            merged += moved;
        }
        Ok(merged)
    }

    /// Set `thread_id` on `root` and every message below it.
    fn move_subtree(&self, root: i64, thread_id: ThreadId) -> Result<usize> {
        let mut children_of = self
            .tx
            .prepare("SELECT id FROM messages WHERE parentid = ?1")?;
        let mut update = self
            .tx
            .prepare("UPDATE messages SET threadid = ?1 WHERE id = ?2")?;

        let mut visited = HashSet::new();
        let mut pending = vec![root];
        while let Some(current) = pending.pop() {
            if !visited.insert(current) {
                continue;
            }
            update.execute(params![thread_id, current])?;
            let children = children_of
                .query_map([current], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            pending.extend(children);
        }
        Ok(visited.len())
    }
}

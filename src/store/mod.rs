//! SQLite archive: schema, list administration and read queries.
//!
//! Writes made by an ingestion run go through a [`Session`], one SQLite
//! transaction opened with `BEGIN IMMEDIATE`. Concurrent runs against the
//! same file are therefore serialized on the database write lock, which is
//! what keeps thread-id resolution and thread merges consistent.

mod session;

pub use session::{LoadErrorEntry, Session, StoreOutcome};

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ArchiveError, Result};
use crate::threading::{self, Reconstruction, ThreadRow};

pub type ListId = i64;
pub type GroupId = i64;
pub type ThreadId = i64;

static MIGRATION_V1: &str = include_str!("schema.v1.sql");

/// A mailing list group with its lists, in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupEntry {
    pub id: GroupId,
    pub name: String,
    pub sortkey: i64,
    pub lists: Vec<ListEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub id: ListId,
    pub name: String,
}

/// Header-level view of a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub message_id: String,
    pub thread_id: ThreadId,
    pub parent_id: Option<i64>,
    /// Parent Message-ID the message declared, resolved or not.
    pub parent_message_id: Option<String>,
    pub date: DateTime<Utc>,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub has_attachment: bool,
}

/// Attachment metadata without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentInfo {
    pub id: i64,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

/// A stored attachment with its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub id: i64,
    pub message: i64,
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A durable record of a skipped message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadErrorRecord {
    pub id: i64,
    pub list: String,
    pub recorded_at: DateTime<Utc>,
    pub message_id: String,
    pub source_type: String,
    pub source: String,
    pub error: String,
}

/// Handle to an archive database.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) an archive file and bring its schema up to date.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        debug!(path = %path.display(), "Opening archive");
        let conn = Connection::open(path)?;
        // Before WAL: switching the journal mode can already hit a lock
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// A private, throwaway archive.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;

        {
            let txn = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
            txn.execute(
                "CREATE TABLE IF NOT EXISTS migration (\
                   version INTEGER NOT NULL PRIMARY KEY, \
                   applied_at INTEGER NOT NULL\
                 )",
                (),
            )?;

            let current_version: u32 = txn
                .query_row("SELECT MAX(version) FROM migration", (), |row| {
                    row.get::<_, Option<u32>>(0)
                })?
                .unwrap_or(0);

            if current_version < 1 {
                info!("Applying V1 migration to archive");
                txn.execute_batch(MIGRATION_V1)?;
                txn.execute(
                    "INSERT INTO migration (version, applied_at) VALUES (1, ?1)",
                    (Utc::now().timestamp(),),
                )?;
            }

            txn.commit()?;
        }

        Ok(Self { conn })
    }

    /// Start a write session.
    ///
    /// Blocks (up to the busy timeout) while another connection holds the
    /// write lock. Dropping the session without committing rolls it back.
    pub fn begin(&self) -> Result<Session<'_>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        Ok(Session::new(tx))
    }

    // ── Groups and lists ────────────────────────────────────────────

    /// Create a list inside `group`, creating the group if it does not exist.
    ///
    /// `sortkey` sets the group's display position; an existing group keeps
    /// its position unless one is given.
    pub fn create_list(&self, name: &str, group: &str, sortkey: Option<i64>) -> Result<ListId> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let existing: Option<ListId> = tx
            .query_row(
                "SELECT listid FROM lists WHERE listname = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(ArchiveError::ListExists(name.to_string()));
        }

        let group_id: Option<GroupId> = tx
            .query_row(
                "SELECT groupid FROM groups WHERE groupname = ?1",
                [group],
                |row| row.get(0),
            )
            .optional()?;
        let group_id = match group_id {
            Some(id) => {
                if let Some(sortkey) = sortkey {
                    tx.execute(
                        "UPDATE groups SET sortkey = ?1 WHERE groupid = ?2",
                        params![sortkey, id],
                    )?;
                }
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO groups (groupname, sortkey) VALUES (?1, ?2)",
                    params![group, sortkey.unwrap_or(0)],
                )?;
                info!(group, "Created group");
                tx.last_insert_rowid()
            }
        };

        tx.execute(
            "INSERT INTO lists (listname, groupid) VALUES (?1, ?2)",
            params![name, group_id],
        )?;
        let list_id = tx.last_insert_rowid();
        tx.commit()?;

        info!(list = name, group, list_id, "Created list");
        Ok(list_id)
    }

    pub fn find_list(&self, name: &str) -> Result<Option<ListId>> {
        Ok(self
            .conn
            .query_row(
                "SELECT listid FROM lists WHERE listname = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Like [`Store::find_list`], but a missing list is an error.
    pub fn resolve_list(&self, name: &str) -> Result<ListId> {
        self.find_list(name)?
            .ok_or_else(|| ArchiveError::ListNotFound(name.to_string()))
    }

    /// Groups ordered by sortkey, each with its lists ordered by name.
    pub fn groups(&self) -> Result<Vec<GroupEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT g.groupid, g.groupname, g.sortkey, l.listid, l.listname \
             FROM groups g LEFT JOIN lists l ON l.groupid = g.groupid \
             ORDER BY g.sortkey, g.groupname, l.listname",
        )?;
        let rows = stmt.query_map((), |row| {
            Ok((
                row.get::<_, GroupId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<ListId>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut groups: Vec<GroupEntry> = Vec::new();
        for row in rows {
            let (id, name, sortkey, list_id, list_name) = row?;
            if groups.last().is_none_or(|g| g.id != id) {
                groups.push(GroupEntry {
                    id,
                    name,
                    sortkey,
                    lists: Vec::new(),
                });
            }
            if let (Some(list_id), Some(list_name), Some(group)) =
                (list_id, list_name, groups.last_mut())
            {
                group.lists.push(ListEntry {
                    id: list_id,
                    name: list_name,
                });
            }
        }
        Ok(groups)
    }

    // ── Messages and threads ────────────────────────────────────────

    /// Every stored message of one thread, in no particular order.
    pub fn thread_rows(&self, thread_id: ThreadId) -> Result<Vec<ThreadRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, parentid, messageid, date, subject, _from, has_attachment \
             FROM messages WHERE threadid = ?1",
        )?;
        let rows = stmt
            .query_map([thread_id], |row| {
                Ok(ThreadRow {
                    id: row.get(0)?,
                    parent_id: row.get(1)?,
                    message_id: row.get(2)?,
                    date: row.get(3)?,
                    subject: row.get(4)?,
                    from: row.get(5)?,
                    has_attachment: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Reconstructed display order of a thread.
    ///
    /// Reads the thread in one statement and rebuilds it in memory; no
    /// consistency with concurrent writers is promised beyond that snapshot.
    pub fn thread(&self, thread_id: ThreadId) -> Result<Reconstruction> {
        let rows = self.thread_rows(thread_id)?;
        if rows.is_empty() {
            return Err(ArchiveError::ThreadNotFound(thread_id));
        }
        Ok(threading::reconstruct(&rows))
    }

    pub fn message(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, messageid, threadid, parentid, parent_messageid, date, \
                        _from, _to, cc, subject, has_attachment \
                 FROM messages WHERE messageid = ?1",
                [message_id],
                |row| {
                    Ok(StoredMessage {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        thread_id: row.get(2)?,
                        parent_id: row.get(3)?,
                        parent_message_id: row.get(4)?,
                        date: row.get(5)?,
                        from: row.get(6)?,
                        to: row.get(7)?,
                        cc: row.get(8)?,
                        subject: row.get(9)?,
                        has_attachment: row.get(10)?,
                    })
                },
            )
            .optional()?)
    }

    /// Verbatim source text of a message.
    pub fn raw_message(&self, message_id: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT rawtxt FROM messages WHERE messageid = ?1",
                [message_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Names of the lists a thread is filed under, sorted.
    pub fn lists_for_thread(&self, thread_id: ThreadId) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.listname FROM list_threads lt \
             JOIN lists l ON l.listid = lt.listid \
             WHERE lt.threadid = ?1 ORDER BY l.listname",
        )?;
        let names = stmt
            .query_map([thread_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Attachments of one message (by internal id), payloads left out.
    pub fn attachments_of(&self, message: i64) -> Result<Vec<AttachmentInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, filename, contenttype, length(attachment) \
             FROM attachments WHERE message = ?1 ORDER BY id",
        )?;
        let infos = stmt
            .query_map([message], |row| {
                Ok(AttachmentInfo {
                    id: row.get(0)?,
                    filename: row.get(1)?,
                    content_type: row.get(2)?,
                    size: row.get::<_, i64>(3)?.max(0) as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(infos)
    }

    pub fn attachment(&self, id: i64) -> Result<Option<StoredAttachment>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, message, filename, contenttype, attachment \
                 FROM attachments WHERE id = ?1",
                [id],
                |row| {
                    Ok(StoredAttachment {
                        id: row.get(0)?,
                        message: row.get(1)?,
                        filename: row.get(2)?,
                        content_type: row.get(3)?,
                        data: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    // ── Load errors and counts ──────────────────────────────────────

    /// Recorded load errors, oldest first, optionally for one list only.
    pub fn load_errors(&self, list: Option<ListId>) -> Result<Vec<LoadErrorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.id, l.listname, e.dat, e.msgid, e.srctype, e.src, e.err \
             FROM loaderrors e JOIN lists l ON l.listid = e.listid \
             WHERE ?1 IS NULL OR e.listid = ?1 \
             ORDER BY e.id",
        )?;
        let records = stmt
            .query_map([list], |row| {
                Ok(LoadErrorRecord {
                    id: row.get(0)?,
                    list: row.get(1)?,
                    recorded_at: row.get(2)?,
                    message_id: row.get(3)?,
                    source_type: row.get(4)?,
                    source: row.get(5)?,
                    error: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn message_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM messages")
    }

    pub fn load_error_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM loaderrors")
    }

    /// Number of distinct threads that currently hold messages.
    pub fn thread_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(DISTINCT threadid) FROM messages")
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(sql, (), |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

//! Index storage: the SQLite file holding messages, attachments and sync state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{IndexError, Result};
use crate::index::schema::{self, SCHEMA_VERSION};
use crate::model::attachment::AttachmentRecord;
use crate::model::identity::{Identity, Inventory};
use crate::model::mail::MessageRecord;

/// Sync-state row written when a pass touched no mailbox.
pub const GLOBAL_SYNC_ACCOUNT: &str = "_global";
pub const GLOBAL_SYNC_MAILBOX: &str = "_sync";

/// Number of indexed messages in one mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailboxCount {
    pub account_id: String,
    pub mailbox: String,
    pub count: usize,
}

/// An open index file.
pub struct Storage {
    conn: Connection,
    path: PathBuf,
}

impl Storage {
    /// Open the index for writing, creating and migrating it as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        schema::create_private_file(&path).map_err(|e| unavailable(&path, e))?;

        let mut conn = Connection::open(&path).map_err(|e| unavailable(&path, e))?;
        schema::configure(&conn).map_err(|e| unavailable(&path, e))?;
        match schema::migrate(&mut conn) {
            Ok(()) => {}
            Err(e @ IndexError::SchemaMismatch { .. }) => return Err(e),
            Err(e) => return Err(unavailable(&path, e)),
        }
        schema::ensure_fts_triggers(&conn).map_err(|e| unavailable(&path, e))?;

        debug!(path = %path.display(), "Opened index for writing");
        Ok(Self { conn, path })
    }

    /// Open an existing index read-only. Readers never migrate.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(unavailable(&path, "index file does not exist"));
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&path, flags).map_err(|e| unavailable(&path, e))?;
        schema::configure_reader(&conn).map_err(|e| unavailable(&path, e))?;

        let found = schema::stored_version(&conn).map_err(|e| unavailable(&path, e))?;
        if found != SCHEMA_VERSION {
            return Err(IndexError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            });
        }
        Ok(Self { conn, path })
    }

    /// Delete the index file and its WAL side files.
    pub fn destroy(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        for suffix in ["", "-wal", "-shm"] {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            let file = PathBuf::from(name);
            match std::fs::remove_file(&file) {
                Ok(()) => debug!(path = %file.display(), "Removed index file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(IndexError::io(file, e)),
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw connection, for the query layer.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Start a transaction; every method of `self` joins it until commit.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    /// Insert or update one message, returning its row id.
    pub fn upsert_message(&self, record: &MessageRecord) -> Result<i64> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO messages (account_id, mailbox, message_id, subject, sender, content,
                                   received_at, path, attachment_count, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(account_id, mailbox, message_id) DO UPDATE SET
                 subject = excluded.subject,
                 sender = excluded.sender,
                 content = excluded.content,
                 received_at = excluded.received_at,
                 path = excluded.path,
                 attachment_count = excluded.attachment_count,
                 indexed_at = excluded.indexed_at
             RETURNING id",
        )?;
        let id = stmt.query_row(
            params![
                record.identity.account_id,
                record.identity.mailbox,
                record.identity.message_id,
                record.subject,
                record.sender,
                record.content,
                record.received_at.map(|d| d.timestamp()),
                path_to_text(&record.path),
                record.attachment_count as i64,
                record.indexed_at.timestamp(),
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Remove a message; attachments go with it. Returns whether a row existed.
    pub fn delete_message(&self, identity: &Identity) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached(
            "DELETE FROM messages WHERE account_id = ?1 AND mailbox = ?2 AND message_id = ?3",
        )?;
        let n = stmt.execute(params![
            identity.account_id,
            identity.mailbox,
            identity.message_id
        ])?;
        Ok(n > 0)
    }

    /// Record a new location for a message without touching its content.
    pub fn update_path(&self, identity: &Identity, path: &Path) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE messages SET path = ?4
             WHERE account_id = ?1 AND mailbox = ?2 AND message_id = ?3",
        )?;
        let n = stmt.execute(params![
            identity.account_id,
            identity.mailbox,
            identity.message_id,
            path_to_text(path)
        ])?;
        Ok(n > 0)
    }

    /// Replace the attachment list of a message.
    pub fn upsert_attachments(&self, message_rowid: i64, attachments: &[AttachmentRecord]) -> Result<()> {
        self.conn
            .prepare_cached("DELETE FROM attachments WHERE message_rowid = ?1")?
            .execute([message_rowid])?;

        let mut insert = self.conn.prepare_cached(
            "INSERT INTO attachments (message_rowid, filename, mime_type, size, content_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for att in attachments {
            insert.execute(params![
                message_rowid,
                att.filename,
                att.mime_type,
                att.size as i64,
                att.content_id
            ])?;
        }
        Ok(())
    }

    /// Identity → path for every indexed message.
    pub fn query_inventory(&self) -> Result<Inventory> {
        let mut stmt = self
            .conn
            .prepare("SELECT account_id, mailbox, message_id, path FROM messages")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                Identity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get(2)?),
                PathBuf::from(row.get::<_, String>(3)?),
            ))
        })?;
        let inventory = rows.collect::<rusqlite::Result<Inventory>>()?;
        Ok(inventory)
    }

    /// Stored inventory restricted to `identities`.
    pub fn query_inventory_for<'a>(
        &self,
        identities: impl IntoIterator<Item = &'a Identity>,
    ) -> Result<Inventory> {
        let mut inventory = Inventory::new();
        for identity in identities {
            if let Some(path) = self.message_path(identity)? {
                inventory.insert(identity.clone(), path);
            }
        }
        Ok(inventory)
    }

    pub fn message_path(&self, identity: &Identity) -> Result<Option<PathBuf>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT path FROM messages WHERE account_id = ?1 AND mailbox = ?2 AND message_id = ?3",
        )?;
        let path = stmt
            .query_row(
                params![identity.account_id, identity.mailbox, identity.message_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from))
    }

    pub fn get_message(&self, identity: &Identity) -> Result<Option<MessageRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT account_id, mailbox, message_id, subject, sender, content, received_at,
                    path, attachment_count, indexed_at
             FROM messages WHERE account_id = ?1 AND mailbox = ?2 AND message_id = ?3",
        )?;
        let record = stmt
            .query_row(
                params![identity.account_id, identity.mailbox, identity.message_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Attachment metadata of one message, in stored order.
    pub fn attachments_of(&self, identity: &Identity) -> Result<Vec<AttachmentRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT a.filename, a.mime_type, a.size, a.content_id
             FROM attachments a JOIN messages m ON m.id = a.message_rowid
             WHERE m.account_id = ?1 AND m.mailbox = ?2 AND m.message_id = ?3
             ORDER BY a.id",
        )?;
        let rows = stmt.query_map(
            params![identity.account_id, identity.mailbox, identity.message_id],
            |row| {
                Ok(AttachmentRecord {
                    filename: row.get(0)?,
                    mime_type: row.get(1)?,
                    size: row.get::<_, i64>(2)?.max(0) as u64,
                    content_id: row.get(3)?,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn record_sync_state(
        &self,
        account_id: &str,
        mailbox: &str,
        at: DateTime<Utc>,
        message_count: usize,
    ) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO sync_state (account_id, mailbox, last_sync, message_count)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id, mailbox) DO UPDATE SET
                     last_sync = excluded.last_sync,
                     message_count = excluded.message_count",
            )?
            .execute(params![account_id, mailbox, at.timestamp(), message_count as i64])?;
        Ok(())
    }

    /// Most recent sync of any mailbox.
    pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let secs: Option<i64> = self
            .conn
            .query_row("SELECT MAX(last_sync) FROM sync_state", [], |row| row.get(0))?;
        Ok(secs.and_then(|s| DateTime::from_timestamp(s, 0)))
    }

    pub fn message_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM messages", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Count of a single mailbox.
    pub fn mailbox_count(&self, account_id: &str, mailbox: &str) -> Result<usize> {
        let n: i64 = self.conn.prepare_cached(
            "SELECT count(*) FROM messages WHERE account_id = ?1 AND mailbox = ?2",
        )?
        .query_row(params![account_id, mailbox], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn mailbox_counts(&self) -> Result<Vec<MailboxCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT account_id, mailbox, count(*) FROM messages
             GROUP BY account_id, mailbox ORDER BY account_id, mailbox",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MailboxCount {
                account_id: row.get(0)?,
                mailbox: row.get(1)?,
                count: row.get::<_, i64>(2)? as usize,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Remove every message and sync-state row.
    pub fn clear(&self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
             DELETE FROM attachments;
             DELETE FROM messages;
             DELETE FROM sync_state;
             COMMIT;",
        )?;
        info!(path = %self.path.display(), "Cleared index");
        Ok(())
    }

    /// Size of the index file plus its write-ahead log.
    pub fn file_size(&self) -> u64 {
        let mut wal = self.path.as_os_str().to_owned();
        wal.push("-wal");
        [self.path.clone(), PathBuf::from(wal)]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    /// Run `load` with FTS triggers disabled, then rebuild the FTS table.
    ///
    /// Triggers are restored whether `load` succeeds or not.
    pub fn with_bulk_load<T>(&self, load: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        schema::drop_fts_triggers(&self.conn)?;
        let result = load(self);
        if let Err(e) = schema::restore_fts(&self.conn) {
            warn!(error = %e, "Failed to rebuild full-text index after bulk load");
            result?;
            return Err(e.into());
        }
        result
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        identity: Identity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get(2)?),
        subject: row.get(3)?,
        sender: row.get(4)?,
        content: row.get(5)?,
        received_at: row
            .get::<_, Option<i64>>(6)?
            .and_then(|s| DateTime::from_timestamp(s, 0)),
        path: PathBuf::from(row.get::<_, String>(7)?),
        attachment_count: row.get::<_, i64>(8)?.max(0) as usize,
        indexed_at: DateTime::from_timestamp(row.get(9)?, 0).unwrap_or_default(),
    })
}

fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn unavailable(path: &Path, reason: impl std::fmt::Display) -> IndexError {
    IndexError::StorageUnavailable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

//! SQLite schema, connection settings and forward-only migrations.
//!
//! The schema version lives in `PRAGMA user_version`. Each migration is
//! idempotent and all pending ones run in a single transaction.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::{debug, info, warn};

use crate::error::{IndexError, Result};

/// Schema version this build writes and expects.
pub const SCHEMA_VERSION: i64 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

type Migration = fn(&Transaction<'_>) -> rusqlite::Result<()>;

/// Ordered migrations; entry `i` brings the store to version `i + 1`.
const MIGRATIONS: &[Migration] = &[migrate_v1_base, migrate_v2_attachments];

const BASE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id  TEXT NOT NULL,
    mailbox     TEXT NOT NULL,
    message_id  INTEGER NOT NULL,
    subject     TEXT NOT NULL DEFAULT '',
    sender      TEXT NOT NULL DEFAULT '',
    content     TEXT NOT NULL DEFAULT '',
    received_at INTEGER,
    path        TEXT NOT NULL,
    indexed_at  INTEGER NOT NULL,
    UNIQUE(account_id, mailbox, message_id)
);

CREATE INDEX IF NOT EXISTS idx_messages_mailbox ON messages(account_id, mailbox);
CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at DESC);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    subject,
    sender,
    content,
    content='messages',
    content_rowid='id',
    tokenize='porter unicode61 remove_diacritics 2'
);

CREATE TABLE IF NOT EXISTS sync_state (
    account_id    TEXT NOT NULL,
    mailbox       TEXT NOT NULL,
    last_sync     INTEGER NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY(account_id, mailbox)
);
"#;

/// Keeps `messages_fts` in step with `messages`. The update trigger only
/// fires for indexed columns, so a path-only move leaves the FTS data alone.
const FTS_TRIGGERS_SQL: &str = r#"
CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, subject, sender, content)
    VALUES (new.id, new.subject, new.sender, new.content);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, sender, content)
    VALUES ('delete', old.id, old.subject, old.sender, old.content);
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE OF subject, sender, content ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, sender, content)
    VALUES ('delete', old.id, old.subject, old.sender, old.content);
    INSERT INTO messages_fts(rowid, subject, sender, content)
    VALUES (new.id, new.subject, new.sender, new.content);
END;
"#;

const DROP_FTS_TRIGGERS_SQL: &str = r#"
DROP TRIGGER IF EXISTS messages_ai;
DROP TRIGGER IF EXISTS messages_ad;
DROP TRIGGER IF EXISTS messages_au;
"#;

const ATTACHMENTS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS attachments (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    message_rowid INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    filename      TEXT NOT NULL,
    mime_type     TEXT NOT NULL DEFAULT 'application/octet-stream',
    size          INTEGER NOT NULL DEFAULT 0,
    content_id    TEXT
);

CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_rowid);
CREATE INDEX IF NOT EXISTS idx_attachments_filename ON attachments(filename);
"#;

fn migrate_v1_base(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(BASE_SQL)?;
    tx.execute_batch(FTS_TRIGGERS_SQL)
}

fn migrate_v2_attachments(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(ATTACHMENTS_SQL)?;
    if !has_column(tx, "messages", "attachment_count")? {
        tx.execute_batch(
            "ALTER TABLE messages ADD COLUMN attachment_count INTEGER NOT NULL DEFAULT 0",
        )?;
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Connection settings applied to the writer connection.
pub fn configure(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!(journal_mode = %mode, "Configured index connection");
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)
}

/// Connection settings for read-only connections (WAL mode is persistent).
pub fn configure_reader(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)
}

/// Version recorded in the store.
pub fn stored_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Bring the store up to [`SCHEMA_VERSION`].
///
/// Fails with `SchemaMismatch` when the store was written by a newer build.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    let found = stored_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(IndexError::SchemaMismatch {
            found,
            expected: SCHEMA_VERSION,
        });
    }
    if found == SCHEMA_VERSION {
        return Ok(());
    }

    info!(from = found, to = SCHEMA_VERSION, "Migrating index schema");
    let tx = conn.transaction()?;
    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        if version > found {
            debug!(version, "Applying migration");
            migration(&tx)?;
        }
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

/// Drop the FTS triggers ahead of a bulk load.
pub fn drop_fts_triggers(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(DROP_FTS_TRIGGERS_SQL)
}

/// Rebuild the FTS table from `messages` and put the triggers back.
pub fn restore_fts(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "INSERT INTO messages_fts(messages_fts) VALUES ('rebuild');
         INSERT INTO messages_fts(messages_fts) VALUES ('optimize');",
    )?;
    conn.execute_batch(FTS_TRIGGERS_SQL)
}

/// Put the FTS triggers back if any is missing and re-derive the FTS data.
///
/// An interrupted bulk load leaves the triggers dropped. Returns `true`
/// when a repair ran.
pub fn ensure_fts_triggers(conn: &Connection) -> rusqlite::Result<bool> {
    let present: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master
         WHERE type = 'trigger' AND name IN ('messages_ai', 'messages_ad', 'messages_au')",
        [],
        |row| row.get(0),
    )?;
    if present == 3 {
        return Ok(false);
    }
    warn!(present, "Full-text triggers missing; rebuilding full-text index");
    restore_fts(conn)?;
    Ok(true)
}

/// Create an empty database file readable only by its owner.
///
/// Must run before SQLite creates the file itself.
pub fn create_private_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| IndexError::io(parent, e))?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    match options.open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(IndexError::io(path, e)),
    }
}

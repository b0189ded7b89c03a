//! Attachment file-name search, newest message first.

use chrono::DateTime;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::debug;

use crate::error::Result;
use crate::model::identity::Identity;

use super::query::like_pattern;
use super::{MatchField, MessageSummary, SearchRequest};

/// Case-insensitive substring match over attachment names; one hit per message.
pub fn search_attachments(conn: &Connection, request: &SearchRequest) -> Result<Vec<MessageSummary>> {
    let mut params = vec![Value::Text(like_pattern(&request.query)?)];
    let filters = request.filter_sql(&mut params);
    params.push(Value::Integer(request.effective_limit() as i64));

    let sql = format!(
        "SELECT m.account_id, m.mailbox, m.message_id, m.subject, m.sender,
                m.received_at, m.attachment_count, group_concat(a.filename, ', ')
         FROM attachments a
         JOIN messages m ON m.id = a.message_rowid
         WHERE a.filename LIKE ? ESCAPE '\\'{filters}
         GROUP BY m.id
         ORDER BY m.received_at DESC, m.id DESC
         LIMIT ?"
    );

    debug!(query = %request.query, "Attachment search");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), |row| {
        Ok(MessageSummary {
            identity: Identity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get(2)?),
            subject: row.get(3)?,
            sender: row.get(4)?,
            received_at: row
                .get::<_, Option<i64>>(5)?
                .and_then(|s| DateTime::from_timestamp(s, 0)),
            attachment_count: row.get::<_, i64>(6)?.max(0) as usize,
            snippet: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            matched: vec![MatchField::Attachment],
            score: 0.0,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Number of messages with at least one matching attachment.
pub fn count_attachments(conn: &Connection, request: &SearchRequest) -> Result<usize> {
    let mut params = vec![Value::Text(like_pattern(&request.query)?)];
    let filters = request.filter_sql(&mut params);
    let sql = format!(
        "SELECT count(DISTINCT m.id)
         FROM attachments a
         JOIN messages m ON m.id = a.message_rowid
         WHERE a.filename LIKE ? ESCAPE '\\'{filters}"
    );
    let n: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
    Ok(n as usize)
}

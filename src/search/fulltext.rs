//! Ranked FTS5 search over subject, sender and body.

use chrono::DateTime;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use tracing::debug;

use crate::error::Result;
use crate::model::identity::Identity;

use super::query::{fts_body_expression, fts_expression};
use super::{MatchField, MessageSummary, SearchRequest, SearchScope};

/// Internal match markers; never present in indexed text.
const OPEN: char = '\u{2}';
const CLOSE: char = '\u{3}';

/// Tokens per snippet.
const SNIPPET_TOKENS: usize = 16;

/// Column weights for bm25: subject, sender, content.
const RANK: &str = "-bm25(messages_fts, 1.0, 0.5, 2.0)";

fn match_expression(request: &SearchRequest) -> Result<String> {
    match request.scope {
        SearchScope::Body => fts_body_expression(&request.query),
        _ => fts_expression(&request.query),
    }
}

/// Search `all` or `body` scope, best match first.
pub fn search_fulltext(conn: &Connection, request: &SearchRequest) -> Result<Vec<MessageSummary>> {
    let expression = match_expression(request)?;
    let mut params = vec![Value::Text(expression.clone())];
    let filters = request.filter_sql(&mut params);
    params.push(Value::Integer(request.effective_limit() as i64));

    let sql = format!(
        "SELECT m.account_id, m.mailbox, m.message_id, m.subject, m.sender,
                m.received_at, m.attachment_count,
                {RANK} AS score,
                highlight(messages_fts, 0, char(2), char(3)),
                highlight(messages_fts, 1, char(2), char(3)),
                snippet(messages_fts, 2, char(2), char(3), '…', {SNIPPET_TOKENS})
         FROM messages_fts
         JOIN messages m ON m.id = messages_fts.rowid
         WHERE messages_fts MATCH ?{filters}
         ORDER BY score DESC
         LIMIT ?"
    );

    debug!(expression = %expression, scope = %request.scope, "Full-text search");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), summary_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Number of messages matching a `all` or `body` search.
pub fn count_fulltext(conn: &Connection, request: &SearchRequest) -> Result<usize> {
    let mut params = vec![Value::Text(match_expression(request)?)];
    let filters = request.filter_sql(&mut params);
    let sql = format!(
        "SELECT count(*) FROM messages_fts
         JOIN messages m ON m.id = messages_fts.rowid
         WHERE messages_fts MATCH ?{filters}"
    );
    let n: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
    Ok(n as usize)
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<MessageSummary> {
    let subject_hl: String = row.get::<_, Option<String>>(8)?.unwrap_or_default();
    let sender_hl: String = row.get::<_, Option<String>>(9)?.unwrap_or_default();
    let snippet: String = row.get::<_, Option<String>>(10)?.unwrap_or_default();

    let mut matched = Vec::new();
    if subject_hl.contains(OPEN) {
        matched.push(MatchField::Subject);
    }
    if sender_hl.contains(OPEN) {
        matched.push(MatchField::Sender);
    }
    if snippet.contains(OPEN) {
        matched.push(MatchField::Content);
    }

    Ok(MessageSummary {
        identity: Identity::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get(2)?),
        subject: row.get(3)?,
        sender: row.get(4)?,
        received_at: row
            .get::<_, Option<i64>>(5)?
            .and_then(|s| DateTime::from_timestamp(s, 0)),
        attachment_count: row.get::<_, i64>(6)?.max(0) as usize,
        score: row.get(7)?,
        snippet: render_snippet(&snippet),
        matched,
    })
}

/// Swap the internal markers for `**` and flatten line breaks.
fn render_snippet(raw: &str) -> String {
    raw.replace([OPEN, CLOSE], "**")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

//! Search engine: ranked full-text queries and attachment-name lookups.
//!
//! Every function takes a plain connection so it runs on a short-lived
//! read-only connection while the writer keeps working.

pub mod attachments;
pub mod fulltext;
pub mod query;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::Result;
use crate::model::identity::Identity;

/// Upper bound for `limit`.
pub const MAX_LIMIT: usize = 500;

/// Default number of results.
pub const DEFAULT_LIMIT: usize = 20;

/// Which fields a query searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    /// Subject, sender and body, ranked by relevance.
    #[default]
    All,
    /// Body only, ranked by relevance.
    Body,
    /// Attachment file names, newest message first.
    Attachments,
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Body => "body",
            Self::Attachments => "attachments",
        })
    }
}

impl FromStr for SearchScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "body" => Ok(Self::Body),
            "attachments" => Ok(Self::Attachments),
            other => Err(format!("unknown search scope '{other}'")),
        }
    }
}

/// Field a result matched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchField {
    Subject,
    Sender,
    Content,
    Attachment,
}

/// One search hit.
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    #[serde(flatten)]
    pub identity: Identity,
    pub subject: String,
    pub sender: String,
    pub received_at: Option<DateTime<Utc>>,
    pub attachment_count: usize,
    /// Short excerpt; matched terms are wrapped in `**`. For attachment
    /// searches, the matching file names.
    pub snippet: String,
    pub matched: Vec<MatchField>,
    /// Relevance, higher is better. Zero for attachment searches.
    pub score: f64,
}

/// A search call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub scope: SearchScope,
    pub limit: usize,
    /// Restrict to one account id. Never matched against display names.
    pub account_id: Option<String>,
    pub mailbox: Option<String>,
    pub exclude_mailboxes: Vec<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, scope: SearchScope) -> Self {
        Self {
            query: query.into(),
            scope,
            limit: DEFAULT_LIMIT,
            account_id: None,
            mailbox: None,
            exclude_mailboxes: Vec::new(),
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn mailbox(mut self, mailbox: impl Into<String>) -> Self {
        self.mailbox = Some(mailbox.into());
        self
    }

    pub fn exclude(mut self, mailboxes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude_mailboxes = mailboxes.into_iter().map(Into::into).collect();
        self
    }

    /// `limit` clamped to `1..=MAX_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIMIT)
    }

    /// Account / mailbox / exclusion conditions on table alias `m`.
    pub(crate) fn filter_sql(&self, params: &mut Vec<Value>) -> String {
        let mut sql = String::new();
        if let Some(account) = &self.account_id {
            sql.push_str(" AND m.account_id = ?");
            params.push(Value::Text(account.clone()));
        }
        if let Some(mailbox) = &self.mailbox {
            sql.push_str(" AND m.mailbox = ?");
            params.push(Value::Text(mailbox.clone()));
        }
        if !self.exclude_mailboxes.is_empty() {
            let placeholders = vec!["?"; self.exclude_mailboxes.len()].join(", ");
            sql.push_str(&format!(" AND m.mailbox NOT IN ({placeholders})"));
            params.extend(self.exclude_mailboxes.iter().cloned().map(Value::Text));
        }
        sql
    }
}

/// Run a search in the requested scope.
pub fn search(conn: &Connection, request: &SearchRequest) -> Result<Vec<MessageSummary>> {
    match request.scope {
        SearchScope::All | SearchScope::Body => fulltext::search_fulltext(conn, request),
        SearchScope::Attachments => attachments::search_attachments(conn, request),
    }
}

/// Total number of messages a search would match, ignoring `limit`.
pub fn count_matches(conn: &Connection, request: &SearchRequest) -> Result<usize> {
    match request.scope {
        SearchScope::All | SearchScope::Body => fulltext::count_fulltext(conn, request),
        SearchScope::Attachments => attachments::count_attachments(conn, request),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parse() {
        assert_eq!("Body".parse::<SearchScope>().unwrap(), SearchScope::Body);
        assert!("everything".parse::<SearchScope>().is_err());
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(SearchRequest::new("x", SearchScope::All).limit(0).effective_limit(), 1);
        assert_eq!(
            SearchRequest::new("x", SearchScope::All).limit(10_000).effective_limit(),
            MAX_LIMIT
        );
    }

    #[test]
    fn test_filter_sql() {
        let request = SearchRequest::new("x", SearchScope::All)
            .account("ACC")
            .exclude(["Drafts", "Junk"]);
        let mut params = Vec::new();
        let sql = request.filter_sql(&mut params);
        assert_eq!(sql, " AND m.account_id = ? AND m.mailbox NOT IN (?, ?)");
        assert_eq!(params.len(), 3);
    }
}

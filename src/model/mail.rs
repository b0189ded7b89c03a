//! Indexed message types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attachment::AttachmentRecord;
use super::identity::Identity;

/// Fields extracted from one message file.
///
/// Identity and source path are not part of the file content; the caller
/// supplies them when turning this into a [`MessageRecord`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMessage {
    /// Decoded subject line (RFC 2047 encoded-words resolved).
    pub subject: String,

    /// `Display Name <address>`, or the bare address.
    pub sender: String,

    /// Plain-text body. Derived from the HTML part when no text part exists.
    pub content: String,

    /// Parsed `Date:` header, if present and valid.
    pub received_at: Option<DateTime<Utc>>,

    /// Attachment metadata, in MIME order.
    pub attachments: Vec<AttachmentRecord>,
}

/// One row of the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub identity: Identity,
    pub subject: String,
    pub sender: String,
    pub content: String,
    pub received_at: Option<DateTime<Utc>>,
    /// Most recently observed location of the `.emlx` file.
    pub path: PathBuf,
    pub attachment_count: usize,
    pub indexed_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Combine parsed fields with the identity and path the scanner found.
    pub fn from_parsed(identity: Identity, path: impl Into<PathBuf>, parsed: &ParsedMessage) -> Self {
        Self {
            identity,
            subject: parsed.subject.clone(),
            sender: parsed.sender.clone(),
            content: parsed.content.clone(),
            received_at: parsed.received_at,
            path: path.into(),
            attachment_count: parsed.attachments.len(),
            indexed_at: Utc::now(),
        }
    }
}

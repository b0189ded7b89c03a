//! Attachment metadata.
//!
//! Only metadata is indexed. Content is decoded from the message file on
//! demand, and only up to a size threshold.

use serde::{Deserialize, Serialize};

/// Metadata about one attachment of an indexed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Filename of the attachment. Generated if missing from the headers.
    pub filename: String,

    /// MIME content type (e.g. `"image/jpeg"`, `"application/pdf"`).
    pub mime_type: String,

    /// Decoded size in bytes. For partially downloaded messages this is the
    /// size of the externally stored file.
    pub size: u64,

    /// Content-ID for inline parts referenced from HTML.
    pub content_id: Option<String>,
}

/// Result of an on-demand attachment extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentContent {
    pub metadata: AttachmentRecord,

    /// Decoded bytes, or `None` when the attachment is above the content cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,

    /// `true` when `content` was withheld because of its size.
    pub truncated: bool,
}

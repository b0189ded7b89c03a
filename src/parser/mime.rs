//! MIME message parsing: indexed fields, attachment listing, on-demand attachment extraction.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use mail_parser::{Message, MessageParser, MimeHeaders, PartType};
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::model::attachment::{AttachmentContent, AttachmentRecord};
use crate::model::mail::ParsedMessage;
use crate::parser::emlx::{self, MAX_MESSAGE_SIZE};
use crate::parser::html::html_to_text;

/// Attachment content above this size is returned as metadata only (10 MiB).
pub const MAX_ATTACHMENT_SIZE: u64 = 10 * 1024 * 1024;

/// Directory next to `Messages/` holding attachments of partially downloaded messages.
const EXTERNAL_ATTACHMENTS_DIR: &str = "Attachments";

/// One attachment part together with its position in the MIME tree.
struct AttachmentPart<'a> {
    record: AttachmentRecord,
    /// 1-based ordinal among the leaf (non-multipart) parts.
    leaf_index: usize,
    contents: &'a [u8],
}

/// Parse one `.emlx` file into indexed fields and attachment metadata.
///
/// Fails with `OversizedFile` above [`MAX_MESSAGE_SIZE`] and with
/// `MalformedMessage` when the framing or the MIME structure is unusable.
pub fn parse_message_file(path: &Path) -> Result<ParsedMessage> {
    let data = emlx::read_capped(path, MAX_MESSAGE_SIZE)?;
    let payload = emlx::mime_payload(&data).map_err(|reason| IndexError::malformed(path, reason))?;
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(IndexError::malformed(path, "empty message"));
    }

    let msg = MessageParser::default()
        .parse(payload)
        .ok_or_else(|| IndexError::malformed(path, "unparseable MIME structure"))?;

    let mut attachments = Vec::new();
    for part in attachment_parts(&msg) {
        let mut record = part.record;
        if part.contents.is_empty() {
            if let Some(external) = external_attachment_for(path, part.leaf_index, &record.filename) {
                record.size = std::fs::metadata(&external).map(|m| m.len()).unwrap_or(0);
            }
        }
        attachments.push(record);
    }

    Ok(ParsedMessage {
        subject: msg.subject().unwrap_or_default().trim().to_string(),
        sender: sender_of(&msg),
        content: body_text(&msg),
        received_at: msg
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0)),
        attachments,
    })
}

/// Decode one attachment of a message file on demand.
///
/// Attachments above `content_limit` come back as metadata with
/// `truncated = true` and no bytes. Partially downloaded messages are
/// resolved through the external `Attachments/` directory.
pub fn extract_attachment(
    path: &Path,
    filename: &str,
    content_limit: u64,
) -> Result<AttachmentContent> {
    let data = emlx::read_capped(path, MAX_MESSAGE_SIZE)?;
    let payload = emlx::mime_payload(&data).map_err(|reason| IndexError::malformed(path, reason))?;
    let msg = MessageParser::default()
        .parse(payload)
        .ok_or_else(|| IndexError::malformed(path, "unparseable MIME structure"))?;

    let part = attachment_parts(&msg)
        .into_iter()
        .find(|p| p.record.filename == filename)
        .ok_or_else(|| {
            IndexError::NotFound(format!("attachment '{filename}' in {}", path.display()))
        })?;

    let mut metadata = part.record;

    if !part.contents.is_empty() {
        let truncated = metadata.size > content_limit;
        return Ok(AttachmentContent {
            content: (!truncated).then(|| part.contents.to_vec()),
            metadata,
            truncated,
        });
    }

    let Some(external) = external_attachment_for(path, part.leaf_index, filename) else {
        debug!(path = %path.display(), filename, "Attachment has no embedded or external content");
        return Ok(AttachmentContent {
            metadata,
            content: Some(Vec::new()),
            truncated: false,
        });
    };

    let size = std::fs::metadata(&external)
        .map_err(|e| IndexError::io(&external, e))?
        .len();
    metadata.size = size;
    if size > content_limit {
        if size > MAX_MESSAGE_SIZE {
            return Err(IndexError::OversizedFile {
                path: external,
                size,
                limit: MAX_MESSAGE_SIZE,
            });
        }
        return Ok(AttachmentContent {
            metadata,
            content: None,
            truncated: true,
        });
    }

    let bytes = emlx::read_capped(&external, content_limit)?;
    Ok(AttachmentContent {
        metadata,
        content: Some(bytes),
        truncated: false,
    })
}

/// Collect attachment parts with their leaf ordinal.
fn attachment_parts<'a>(msg: &'a Message<'a>) -> Vec<AttachmentPart<'a>> {
    let mut result = Vec::new();
    let mut leaf_index = 0usize;

    for (idx, part) in msg.parts.iter().enumerate() {
        if matches!(part.body, PartType::Multipart(_)) {
            continue;
        }
        leaf_index += 1;
        if !msg.attachments.iter().any(|&id| id as usize == idx) {
            continue;
        }

        let filename = part
            .attachment_name()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("attachment_{}", result.len() + 1));

        let mime_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string())
            .to_lowercase();

        let contents = part.contents();
        result.push(AttachmentPart {
            record: AttachmentRecord {
                filename,
                mime_type,
                size: contents.len() as u64,
                content_id: part
                    .content_id()
                    .map(|id| id.trim_matches(|c| c == '<' || c == '>').to_string()),
            },
            leaf_index,
            contents,
        });
    }

    result
}

/// `Display Name <address>`, or whichever half is present.
fn sender_of(msg: &Message<'_>) -> String {
    let Some(addr) = msg.from().and_then(|a| a.first()) else {
        return String::new();
    };
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) if !name.trim().is_empty() => {
            format!("{} <{}>", name.trim(), address)
        }
        (_, Some(address)) => address.to_string(),
        (Some(name), None) => name.trim().to_string(),
        (None, None) => String::new(),
    }
}

/// All `text/plain` bodies, or failing that all `text/html` bodies as text.
fn body_text(msg: &Message<'_>) -> String {
    let plain: Vec<&str> = msg
        .text_bodies()
        .filter_map(|p| match &p.body {
            PartType::Text(text) => Some(text.as_ref()),
            _ => None,
        })
        .collect();
    if !plain.is_empty() {
        return plain.join("\n").trim_end().to_string();
    }

    msg.html_bodies()
        .filter_map(|p| match &p.body {
            PartType::Html(html) => Some(html_to_text(html)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Locate the external copy of an attachment of a partially downloaded message.
///
/// Layout: `<Messages>/../Attachments/<message id>/<leaf index>/<file>`. The
/// exact name is tried first, then the only file of the part directory.
/// Names that could leave the part directory never resolve.
pub fn external_attachment_for(emlx_path: &Path, leaf_index: usize, filename: &str) -> Option<PathBuf> {
    if !is_plain_file_name(filename) {
        return None;
    }
    let (message_id, _) = emlx::message_id_from_path(emlx_path)?;
    let part_dir = emlx_path
        .parent()?
        .parent()?
        .join(EXTERNAL_ATTACHMENTS_DIR)
        .join(message_id.to_string())
        .join(leaf_index.to_string());
    if !part_dir.is_dir() {
        return None;
    }

    let exact = part_dir.join(filename);
    if exact.is_file() {
        return Some(exact);
    }

    let mut files = std::fs::read_dir(&part_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file());
    match (files.next(), files.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

/// `true` when `name` is a single normal path component.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

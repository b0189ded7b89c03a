//! `.emlx` framing: byte-count line, RFC 5322 message, plist trailer.
//!
//! ```text
//! 1255                      <- byte count of the message that follows
//! From: sender@example.com  <- RFC 5322 headers + body
//! ...
//! <?xml version="1.0"?>     <- plist trailer, ignored
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{IndexError, Result};

/// Messages above this size are skipped (25 MiB).
pub const MAX_MESSAGE_SIZE: u64 = 25 * 1024 * 1024;

/// File extension of message files.
pub const EMLX_EXTENSION: &str = "emlx";

const PARTIAL_SUFFIX: &str = ".partial";

/// Message id and partial flag encoded in a file name.
///
/// `12345.emlx` → `(12345, false)`, `67301.partial.emlx` → `(67301, true)`.
/// Anything else is not a message file.
pub fn message_id_from_path(path: &Path) -> Option<(i64, bool)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".emlx")?;
    let (digits, partial) = match stem.strip_suffix(PARTIAL_SUFFIX) {
        Some(s) => (s, true),
        None => (stem, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|id| (id, partial))
}

/// Read a whole file, refusing anything above `limit` bytes.
///
/// The size is checked from metadata first, then enforced again while
/// reading so a file that grows in between is never fully buffered.
pub fn read_capped(path: &Path, limit: u64) -> Result<Vec<u8>> {
    let meta = std::fs::metadata(path).map_err(|e| IndexError::io(path, e))?;
    if meta.len() > limit {
        return Err(IndexError::OversizedFile {
            path: path.to_path_buf(),
            size: meta.len(),
            limit,
        });
    }

    let file = File::open(path).map_err(|e| IndexError::io(path, e))?;
    let mut buf = Vec::with_capacity(meta.len() as usize);
    file.take(limit + 1)
        .read_to_end(&mut buf)
        .map_err(|e| IndexError::io(path, e))?;

    if buf.len() as u64 > limit {
        return Err(IndexError::OversizedFile {
            path: path.to_path_buf(),
            size: buf.len() as u64,
            limit,
        });
    }
    Ok(buf)
}

/// Slice the RFC 5322 message out of raw `.emlx` bytes.
///
/// A byte count larger than the data is clamped to what is there.
pub fn mime_payload(data: &[u8]) -> std::result::Result<&[u8], String> {
    let newline = data
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| "missing byte-count line".to_string())?;

    let count_line = std::str::from_utf8(&data[..newline])
        .map_err(|_| "byte-count line is not text".to_string())?
        .trim();
    let count: usize = count_line
        .parse()
        .map_err(|_| format!("invalid byte count '{}'", truncate(count_line, 32)))?;

    let start = newline + 1;
    let end = start.saturating_add(count).min(data.len());
    Ok(&data[start..end])
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

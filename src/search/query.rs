//! Turning untrusted query text into FTS5 match expressions.
//!
//! User input never reaches FTS5 as syntax. Every whitespace-separated
//! token becomes a quoted string, so `AND`, `NEAR(`, `col:`, `-` and stray
//! quotes all match literally.
//!
//! - `invoice march` → `"invoice" "march"` (implicit AND)
//! - `meet*` → `"meet"*` (prefix match is the one operator kept)
//! - `say "hi` → `"say" """hi"`
//! - `( ) -` → rejected, nothing searchable left

use crate::error::{IndexError, Result};

/// Column filter prepended to each phrase for body-only searches.
const CONTENT_COLUMN: &str = "content";

/// One sanitized token.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Phrase {
    text: String,
    prefix: bool,
}

impl Phrase {
    fn render(&self) -> String {
        let quoted = format!("\"{}\"", self.text.replace('"', "\"\""));
        if self.prefix {
            quoted + "*"
        } else {
            quoted
        }
    }
}

fn phrases(input: &str) -> Result<Vec<Phrase>> {
    if input.trim().is_empty() {
        return Err(IndexError::InvalidQuery("query is empty".into()));
    }

    let phrases: Vec<Phrase> = input
        .split_whitespace()
        .filter_map(|token| {
            let stripped = token.trim_end_matches('*');
            let prefix = stripped.len() < token.len();
            stripped
                .chars()
                .any(char::is_alphanumeric)
                .then(|| Phrase {
                    text: stripped.to_string(),
                    prefix,
                })
        })
        .collect();

    if phrases.is_empty() {
        return Err(IndexError::InvalidQuery(format!(
            "'{}' contains nothing searchable",
            input.trim()
        )));
    }
    Ok(phrases)
}

/// FTS5 expression matching all tokens in any indexed column.
pub fn fts_expression(input: &str) -> Result<String> {
    Ok(phrases(input)?
        .iter()
        .map(Phrase::render)
        .collect::<Vec<_>>()
        .join(" "))
}

/// FTS5 expression matching all tokens in the body only.
pub fn fts_body_expression(input: &str) -> Result<String> {
    Ok(phrases(input)?
        .iter()
        .map(|p| format!("{CONTENT_COLUMN} : {}", p.render()))
        .collect::<Vec<_>>()
        .join(" "))
}

/// `%…%` LIKE pattern for a case-insensitive substring match, with `\` as
/// the escape character.
pub fn like_pattern(input: &str) -> Result<String> {
    let needle = input.trim();
    if needle.is_empty() {
        return Err(IndexError::InvalidQuery("query is empty".into()));
    }
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    Ok(pattern)
}

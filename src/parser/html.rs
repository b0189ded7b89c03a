//! HTML-to-text conversion for indexing.
//!
//! Uses a real HTML parser so malformed markup such as `<<script>` or
//! unterminated tags cannot leak script text into the index.

use scraper::{Html, Node};

/// Elements whose text content is never indexed.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "head", "template", "title"];

/// Elements that start a new line in the extracted text.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "footer", "h1",
    "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "ol", "p", "pre", "section", "table",
    "td", "th", "tr", "ul",
];

/// Convert an HTML document or fragment to plain text.
///
/// - Drops `script`, `style` and other non-content elements entirely
/// - Starts a new line at block elements and `<br>`
/// - Decodes entities (done by the parser)
/// - Collapses runs of spaces and keeps at most one blank line
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::with_capacity(html.len() / 2);

    for node in document.tree.root().descendants() {
        match node.value() {
            Node::Text(text) => {
                let hidden = node.ancestors().any(|a| {
                    a.value()
                        .as_element()
                        .is_some_and(|el| SKIPPED_ELEMENTS.contains(&el.name()))
                });
                if hidden {
                    continue;
                }
                // Text right after a closed block element starts a new line.
                let after_block = node
                    .prev_sibling()
                    .and_then(|s| s.value().as_element())
                    .is_some_and(|el| el.name() != "br" && BLOCK_ELEMENTS.contains(&el.name()));
                if after_block {
                    raw.push('\n');
                }
                raw.push_str(text);
            }
            Node::Element(el) if BLOCK_ELEMENTS.contains(&el.name()) => raw.push('\n'),
            _ => {}
        }
    }

    collapse_whitespace(&raw)
}

/// Trim every line, squeeze inner spaces, and keep at most one blank line in a row.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;

    for line in text.lines() {
        let squeezed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if squeezed.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push('\n');
            }
            continue;
        }
        blank_run = 0;
        out.push_str(&squeezed);
        out.push('\n');
    }

    out.trim().to_string()
}

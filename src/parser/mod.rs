//! Message-file parsing: `.emlx` framing, MIME field extraction, HTML-to-text.

pub mod emlx;
pub mod html;
pub mod mime;

pub use mime::{extract_attachment, parse_message_file};

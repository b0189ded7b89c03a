//! Persistent index: SQLite schema and storage operations.

pub mod schema;
pub mod storage;

pub use storage::{MailboxCount, Storage};

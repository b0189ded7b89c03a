//! `mailindex`: a local full-text index over an on-disk `.emlx` mail store.
//!
//! The index is derived state: it is built by walking the store, kept in
//! step by reconciling disk and index inventories, and can always be
//! thrown away and rebuilt.

pub mod config;
pub mod error;
pub mod index;
pub mod manager;
pub mod model;
pub mod parser;
pub mod search;
pub mod store;
pub mod sync;
pub mod watcher;

pub use error::{IndexError, Result};
pub use manager::{BuildReport, IndexManager, IndexSettings, IndexStats, MailClientBridge};
pub use model::identity::{Identity, Inventory};
pub use search::{MatchField, MessageSummary, SearchRequest, SearchScope};
pub use sync::ChangeCount;

//! Core data model types: message identity, inventories, indexed records, attachments.

pub mod attachment;
pub mod identity;
pub mod mail;

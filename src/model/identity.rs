//! Message identity and inventories.
//!
//! A message id taken from the file name is unique only within one
//! account + mailbox, so every lookup goes through the full [`Identity`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// `(account_id, mailbox, message_id)`: the key of one indexed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    /// Account directory name (a UUID for the stock mail client).
    pub account_id: String,
    /// Mailbox name without the `.mbox` suffix; nested mailboxes joined by `/`.
    pub mailbox: String,
    /// Numeric file stem of the `.emlx` file.
    pub message_id: i64,
}

impl Identity {
    pub fn new(account_id: impl Into<String>, mailbox: impl Into<String>, message_id: i64) -> Self {
        Self {
            account_id: account_id.into(),
            mailbox: mailbox.into(),
            message_id,
        }
    }

    /// The `(account_id, mailbox)` pair this message lives in.
    pub fn mailbox_key(&self) -> MailboxKey {
        MailboxKey {
            account_id: self.account_id.clone(),
            mailbox: self.mailbox.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.account_id, self.mailbox, self.message_id)
    }
}

/// One mailbox of one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailboxKey {
    pub account_id: String,
    pub mailbox: String,
}

/// Snapshot mapping identity → source file path.
///
/// Produced either by walking the mail store or by querying the index;
/// reconciliation only ever compares two of these.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    entries: HashMap<Identity, PathBuf>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: Identity, path: impl Into<PathBuf>) -> Option<PathBuf> {
        self.entries.insert(identity, path.into())
    }

    pub fn get(&self, identity: &Identity) -> Option<&Path> {
        self.entries.get(identity).map(PathBuf::as_path)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<PathBuf> {
        self.entries.remove(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &Path)> {
        self.entries.iter().map(|(k, v)| (k, v.as_path()))
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entries.keys()
    }
}

impl FromIterator<(Identity, PathBuf)> for Inventory {
    fn from_iter<I: IntoIterator<Item = (Identity, PathBuf)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Inventory {
    type Item = (Identity, PathBuf);
    type IntoIter = std::collections::hash_map::IntoIter<Identity, PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

//! Mail store directory layout.
//!
//! ```text
//! ~/Library/Mail/V10/
//! ├── <account-uuid>/
//! │   └── <Mailbox>.mbox/
//! │       ├── <Child>.mbox/…
//! │       └── Data/x/y/Messages/
//! │           ├── 12345.emlx
//! │           └── 12346.partial.emlx
//! └── MailData/
//! ```

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{IndexError, Result};
use crate::model::identity::Identity;
use crate::parser::emlx;

const MAILBOX_SUFFIX: &str = ".mbox";

/// Locate the mail client's data directory: the highest `V<N>` under `~/Library/Mail`.
pub fn find_mail_directory() -> Result<PathBuf> {
    let base = dirs::home_dir()
        .map(|h| h.join("Library").join("Mail"))
        .ok_or_else(|| IndexError::MailStoreNotFound(PathBuf::from("~/Library/Mail")))?;
    latest_version_dir(&base)
}

/// Highest-numbered `V<N>` directory inside `base`.
pub fn latest_version_dir(base: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(base).map_err(|_| IndexError::MailStoreNotFound(base.to_path_buf()))?;

    let best = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name();
            let version: u32 = name.to_str()?.strip_prefix('V')?.parse().ok()?;
            Some((version, e.path()))
        })
        .max_by_key(|(version, _)| *version);

    match best {
        Some((version, path)) => {
            debug!(version, path = %path.display(), "Found mail directory");
            Ok(path)
        }
        None => Err(IndexError::MailStoreNotFound(base.to_path_buf())),
    }
}

/// Derive the identity of a message file from its location under `root`.
///
/// The account is the first component below the root. The mailbox is the
/// chain of `.mbox` components (suffix removed) joined by `/`; without any,
/// the second component is used as-is. Returns `None` for anything that is
/// not a message file inside a mailbox.
pub fn identity_for_path(root: &Path, path: &Path) -> Option<Identity> {
    let (message_id, _) = emlx::message_id_from_path(path)?;
    let relative = path.strip_prefix(root).ok()?;

    let mut names = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => names.push(name.to_str()?),
            _ => return None,
        }
    }
    // account / mailbox / … / file
    if names.len() < 3 {
        return None;
    }

    let account_id = names[0];
    let dirs = &names[1..names.len() - 1];
    let nested: Vec<&str> = dirs
        .iter()
        .filter_map(|d| d.strip_suffix(MAILBOX_SUFFIX))
        .filter(|d| !d.is_empty())
        .collect();

    let mailbox = if nested.is_empty() {
        dirs[0].to_string()
    } else {
        nested.join("/")
    };

    Some(Identity::new(account_id, mailbox, message_id))
}

/// `true` when `mailbox` (or its last nested segment) is in `excluded`.
pub fn is_excluded(mailbox: &str, excluded: &[String]) -> bool {
    let leaf = mailbox.rsplit('/').next().unwrap_or(mailbox);
    excluded
        .iter()
        .any(|e| e.eq_ignore_ascii_case(mailbox) || e.eq_ignore_ascii_case(leaf))
}

/// The other file name a message may have: `N.emlx` ↔ `N.partial.emlx`.
pub fn sibling_variant(path: &Path) -> Option<PathBuf> {
    let (id, partial) = emlx::message_id_from_path(path)?;
    let name = if partial {
        format!("{id}.emlx")
    } else {
        format!("{id}.partial.emlx")
    };
    Some(path.with_file_name(name))
}

/// `true` for the partially downloaded variant of a message file.
pub fn is_partial(path: &Path) -> bool {
    emlx::message_id_from_path(path).is_some_and(|(_, partial)| partial)
}

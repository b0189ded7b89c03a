//! Disk scanner: builds an identity → path inventory from file names alone.
//!
//! No message file is opened. Entries that vanish during the walk (the mail
//! client moves files constantly) are treated as absent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{IndexError, Result};
use crate::model::identity::{Identity, Inventory};
use crate::parser::emlx::EMLX_EXTENSION;
use crate::store::layout::{identity_for_path, is_excluded, is_partial, sibling_variant};

/// Result of one walk over the mail store.
#[derive(Debug, Default)]
pub struct Scan {
    pub inventory: Inventory,
    /// Entries that could not be read for reasons other than disappearing.
    pub unreadable: usize,
}

/// Walk `root` and collect every message file outside the excluded mailboxes.
///
/// When both `N.emlx` and `N.partial.emlx` exist for one identity, the full
/// file wins.
pub fn scan(root: &Path, excluded: &[String]) -> Result<Scan> {
    if !root.is_dir() {
        return Err(IndexError::MailStoreNotFound(root.to_path_buf()));
    }

    let mut result = Scan::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_excluded_dir(entry.path(), excluded));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                if e.io_error().is_some_and(|io| io.kind() == ErrorKind::NotFound) {
                    debug!(error = %e, "Entry vanished during scan");
                } else {
                    warn!(error = %e, "Skipping unreadable entry");
                    result.unreadable += 1;
                }
                continue;
            }
        };

        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|e| e.to_str()) != Some(EMLX_EXTENSION)
        {
            continue;
        }

        let path = entry.path();
        let Some(identity) = identity_for_path(root, path) else {
            continue;
        };
        if is_excluded(&identity.mailbox, excluded) {
            continue;
        }

        let keep_existing = result
            .inventory
            .get(&identity)
            .is_some_and(|existing| !is_partial(existing));
        if !keep_existing {
            result.inventory.insert(identity, path.to_path_buf());
        }
    }

    info!(
        root = %root.display(),
        messages = result.inventory.len(),
        unreadable = result.unreadable,
        "Scanned mail store"
    );
    Ok(result)
}

/// Resolve where an identity currently lives, given paths it was seen at.
///
/// Checks every hint and its full/partial sibling; a full file anywhere
/// beats a partial one. `None` means the message is gone from disk.
pub fn probe(root: &Path, identity: &Identity, hints: &[PathBuf]) -> Option<PathBuf> {
    let mut partial = None;
    for hint in hints {
        let candidates = std::iter::once(hint.clone()).chain(sibling_variant(hint));
        for candidate in candidates {
            if !candidate.is_file() || identity_for_path(root, &candidate).as_ref() != Some(identity) {
                continue;
            }
            if !is_partial(&candidate) {
                return Some(candidate);
            }
            partial.get_or_insert(candidate);
        }
    }
    partial
}

/// Modification time, or `None` when the file cannot be stat'ed.
pub fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn is_excluded_dir(path: &Path, excluded: &[String]) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(".mbox"))
        .is_some_and(|name| is_excluded(name, excluded))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"1\nx").unwrap();
        path
    }

    #[test]
    fn test_scan_collects_messages() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "ACC/INBOX.mbox/Data/Messages/1.emlx");
        touch(dir.path(), "ACC/INBOX.mbox/Data/Messages/2.emlx");
        touch(dir.path(), "ACC/Archive.mbox/Data/Messages/1.emlx");
        touch(dir.path(), "ACC/INBOX.mbox/Data/Messages/notes.txt");
        touch(dir.path(), "ACC/INBOX.mbox/Info.plist");

        let scan = scan(dir.path(), &[]).unwrap();
        assert_eq!(scan.inventory.len(), 3);
        assert!(scan.inventory.contains(&Identity::new("ACC", "Archive", 1)));
    }

    #[test]
    fn test_scan_prefers_full_over_partial() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "ACC/INBOX.mbox/Messages/5.partial.emlx");
        let full = touch(dir.path(), "ACC/INBOX.mbox/Messages/5.emlx");

        let scan = scan(dir.path(), &[]).unwrap();
        assert_eq!(scan.inventory.len(), 1);
        assert_eq!(
            scan.inventory.get(&Identity::new("ACC", "INBOX", 5)),
            Some(full.as_path())
        );
    }

    #[test]
    fn test_scan_skips_excluded_mailboxes() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "ACC/INBOX.mbox/Messages/1.emlx");
        touch(dir.path(), "ACC/Drafts.mbox/Messages/2.emlx");

        let scan = scan(dir.path(), &["Drafts".to_string()]).unwrap();
        assert_eq!(scan.inventory.len(), 1);
    }

    #[test]
    fn test_scan_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            scan(&missing, &[]),
            Err(IndexError::MailStoreNotFound(_))
        ));
    }

    #[test]
    fn test_probe_finds_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let full = touch(dir.path(), "ACC/INBOX.mbox/Messages/8.emlx");
        let id = Identity::new("ACC", "INBOX", 8);
        let gone = dir.path().join("ACC/INBOX.mbox/Messages/8.partial.emlx");

        assert_eq!(probe(dir.path(), &id, &[gone]), Some(full.clone()));
        std::fs::remove_file(&full).unwrap();
        assert_eq!(probe(dir.path(), &id, &[full]), None);
    }
}

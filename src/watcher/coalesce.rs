//! Event validation and per-identity coalescing.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use notify::{Event, EventKind};
use tracing::{debug, warn};

use crate::error::{IndexError, Result};
use crate::model::identity::Identity;
use crate::parser::emlx::EMLX_EXTENSION;
use crate::store::layout::{identity_for_path, is_excluded};

/// Check that `path` lies strictly inside the store root.
///
/// Accepts either the root as configured or its canonical form (some
/// platforms report `/private/var/…` for `/var/…`). Returns whichever root
/// the path is relative to.
pub fn validate_path<'a>(root: &'a Path, canonical_root: Option<&'a Path>, path: &Path) -> Result<&'a Path> {
    let base = if path.starts_with(root) {
        root
    } else {
        match canonical_root {
            Some(canonical) if path.starts_with(canonical) => canonical,
            _ => return Err(IndexError::PathTraversal(path.to_path_buf())),
        }
    };

    let relative = path
        .strip_prefix(base)
        .map_err(|_| IndexError::PathTraversal(path.to_path_buf()))?;
    let clean = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !clean || relative.as_os_str().is_empty() {
        return Err(IndexError::PathTraversal(path.to_path_buf()));
    }
    Ok(base)
}

/// Pending identities and the paths they were seen at.
#[derive(Debug)]
pub struct Coalescer {
    root: PathBuf,
    canonical_root: Option<PathBuf>,
    excluded: Vec<String>,
    max_pending: usize,
    pending: HashMap<Identity, Vec<PathBuf>>,
    overflowed: bool,
}

impl Coalescer {
    pub fn new(root: impl Into<PathBuf>, excluded: Vec<String>, max_pending: usize) -> Self {
        let root = root.into();
        let canonical_root = std::fs::canonicalize(&root).ok().filter(|c| *c != root);
        Self {
            root,
            canonical_root,
            excluded,
            max_pending: max_pending.max(1),
            pending: HashMap::new(),
            overflowed: false,
        }
    }

    /// Fold one raw event into the pending set.
    pub fn record(&mut self, event: &Event) {
        if matches!(event.kind, EventKind::Access(_)) || self.overflowed {
            return;
        }

        for path in &event.paths {
            if path.extension().and_then(|e| e.to_str()) != Some(EMLX_EXTENSION) {
                continue;
            }
            let base = match validate_path(&self.root, self.canonical_root.as_deref(), path) {
                Ok(base) => base,
                Err(e) => {
                    warn!(error = %e, "Dropping watcher event");
                    continue;
                }
            };
            let Some(identity) = identity_for_path(base, path) else {
                continue;
            };
            if is_excluded(&identity.mailbox, &self.excluded) {
                continue;
            }

            // Hints are stored under the configured root so they compare
            // equal to scanner paths.
            let hint = match path.strip_prefix(base) {
                Ok(rel) => self.root.join(rel),
                Err(_) => path.clone(),
            };
            let hints = self.pending.entry(identity).or_default();
            if !hints.contains(&hint) {
                hints.push(hint);
            }
        }

        if self.pending.len() > self.max_pending {
            warn!(
                pending = self.pending.len(),
                max = self.max_pending,
                "Too many pending changes; falling back to a full sync"
            );
            self.mark_overflow();
        }
    }

    /// Drop pending changes; the next flush runs a full sync.
    pub fn mark_overflow(&mut self) {
        self.overflowed = true;
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && !self.overflowed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Take everything pending, resetting the coalescer.
    pub fn take(&mut self) -> Pending {
        if std::mem::take(&mut self.overflowed) {
            self.pending.clear();
            return Pending::FullSync;
        }
        let changes = std::mem::take(&mut self.pending);
        debug!(identities = changes.len(), "Flushing coalesced changes");
        Pending::Changes(changes)
    }
}

/// What a flush hands to the index.
#[derive(Debug, Clone, PartialEq)]
pub enum Pending {
    /// Touched identities with every path they were seen at.
    Changes(HashMap<Identity, Vec<PathBuf>>),
    /// Too much happened at once; rescan everything.
    FullSync,
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};

    const ROOT: &str = "/mail/V10";

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_validate_rejects_traversal() {
        let root = Path::new(ROOT);
        assert!(validate_path(root, None, Path::new("/mail/V10/A/INBOX.mbox/1.emlx")).is_ok());
        assert!(matches!(
            validate_path(root, None, Path::new("/mail/V10/A/../../etc/1.emlx")),
            Err(IndexError::PathTraversal(_))
        ));
        assert!(validate_path(root, None, Path::new("/etc/passwd")).is_err());
        assert!(validate_path(root, None, Path::new("/mail/V100/A/x.emlx")).is_err());
        assert!(validate_path(root, None, Path::new(ROOT)).is_err());
    }

    #[test]
    fn test_validate_accepts_canonical_root() {
        let root = Path::new("/var/mail");
        let canonical = Path::new("/private/var/mail");
        let base = validate_path(root, Some(canonical), Path::new("/private/var/mail/A/B.mbox/1.emlx"))
            .unwrap();
        assert_eq!(base, canonical);
    }

    #[test]
    fn test_burst_collapses_to_one_identity() {
        let mut c = Coalescer::new(ROOT, vec![], 100);
        let tmp = "/mail/V10/A/INBOX.mbox/Data/Messages/5.emlx";
        c.record(&event(EventKind::Create(CreateKind::File), tmp));
        c.record(&event(EventKind::Modify(ModifyKind::Any), tmp));
        c.record(&event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), tmp));
        assert_eq!(c.len(), 1);

        let Pending::Changes(changes) = c.take() else {
            panic!("expected changes");
        };
        assert_eq!(changes[&Identity::new("A", "INBOX", 5)].len(), 1);
        assert!(c.is_empty());
    }

    #[test]
    fn test_non_message_files_are_ignored() {
        let mut c = Coalescer::new(ROOT, vec![], 100);
        c.record(&event(EventKind::Create(CreateKind::File), "/mail/V10/A/INBOX.mbox/Info.plist"));
        c.record(&event(EventKind::Create(CreateKind::File), "/mail/V10/A/INBOX.mbox/x.emlx.tmp"));
        assert!(c.is_empty());
    }

    #[test]
    fn test_excluded_mailboxes_are_ignored() {
        let mut c = Coalescer::new(ROOT, vec!["Drafts".into()], 100);
        c.record(&event(EventKind::Remove(RemoveKind::File), "/mail/V10/A/Drafts.mbox/M/1.emlx"));
        assert!(c.is_empty());
    }

    #[test]
    fn test_overflow_turns_into_full_sync() {
        let mut c = Coalescer::new(ROOT, vec![], 2);
        for id in 1..=3 {
            let path = format!("/mail/V10/A/INBOX.mbox/M/{id}.emlx");
            c.record(&event(EventKind::Create(CreateKind::File), &path));
        }
        assert_eq!(c.take(), Pending::FullSync);
        assert!(c.is_empty());
    }
}

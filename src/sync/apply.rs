//! Applying a [`SyncPlan`] to the index.
//!
//! Order: deletions, then moves, then additions. Additions are parsed
//! newest-first per mailbox so the per-mailbox cap keeps recent mail.
//! Writes are grouped in transactions of [`BATCH_SIZE`] items.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::Transaction;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::index::storage::{Storage, GLOBAL_SYNC_ACCOUNT, GLOBAL_SYNC_MAILBOX};
use crate::model::identity::{Identity, MailboxKey};
use crate::model::mail::MessageRecord;
use crate::parser;
use crate::store::scanner::modified_time;

use super::diff::SyncPlan;

/// Items per write transaction.
pub const BATCH_SIZE: usize = 500;

/// Progress callback: `(processed, total)`; returning `false` cancels.
pub type Progress<'a> = &'a dyn Fn(usize, usize) -> bool;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCount {
    pub added: usize,
    pub deleted: usize,
    pub moved: usize,
    /// Existing messages re-parsed because their file changed.
    pub updated: usize,
    /// Files that failed to parse or could not be written.
    pub errors: usize,
    /// New files left out because their mailbox reached the cap.
    pub excluded_by_cap: usize,
    /// The pass stopped early at the caller's request.
    pub cancelled: bool,
}

impl ChangeCount {
    /// Number of index rows that changed.
    pub fn total(&self) -> usize {
        self.added + self.deleted + self.moved + self.updated
    }
}

/// Tuning for [`apply`].
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum indexed messages per mailbox.
    pub max_per_mailbox: usize,
    pub batch_size: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            max_per_mailbox: 5000,
            batch_size: BATCH_SIZE,
        }
    }
}

/// Groups writes into transactions of a fixed size.
struct Batch<'a> {
    storage: &'a Storage,
    tx: Option<Transaction<'a>>,
    pending: usize,
    size: usize,
}

impl<'a> Batch<'a> {
    fn new(storage: &'a Storage, size: usize) -> Self {
        Self {
            storage,
            tx: None,
            pending: 0,
            size: size.max(1),
        }
    }

    fn open(&mut self) -> Result<()> {
        if self.tx.is_none() {
            self.tx = Some(self.storage.begin()?);
        }
        Ok(())
    }

    fn item_done(&mut self) -> Result<()> {
        self.pending += 1;
        if self.pending >= self.size {
            self.commit()?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit()?;
            debug!(items = self.pending, "Committed batch");
        }
        self.pending = 0;
        Ok(())
    }
}

/// Counts processed items and asks the caller whether to continue.
struct Tracker<'a> {
    processed: usize,
    total: usize,
    progress: Option<Progress<'a>>,
    cancelled: bool,
}

impl Tracker<'_> {
    fn step(&mut self) {
        self.processed += 1;
        if let Some(progress) = self.progress {
            if !progress(self.processed, self.total) {
                info!(processed = self.processed, total = self.total, "Sync cancelled");
                self.cancelled = true;
            }
        }
    }
}

/// Apply `plan`, then re-parse `refresh` (identities that stayed in place
/// but whose file may have changed).
///
/// Per-file failures are counted in [`ChangeCount::errors`] and never abort
/// the pass. Storage failures do; work committed in earlier batches stays.
pub fn apply(
    storage: &Storage,
    plan: &SyncPlan,
    refresh: &[(Identity, PathBuf)],
    options: &ApplyOptions,
    progress: Option<Progress<'_>>,
) -> Result<ChangeCount> {
    let mut counts = ChangeCount::default();
    let mut tracker = Tracker {
        processed: 0,
        total: plan.len() + refresh.len(),
        progress,
        cancelled: false,
    };
    let mut batch = Batch::new(storage, options.batch_size);
    let mut touched: BTreeSet<MailboxKey> = BTreeSet::new();

    for identity in &plan.deleted {
        if tracker.cancelled {
            break;
        }
        batch.open()?;
        if storage.delete_message(identity)? {
            counts.deleted += 1;
        }
        touched.insert(identity.mailbox_key());
        batch.item_done()?;
        tracker.step();
    }

    for (identity, path) in &plan.moved {
        if tracker.cancelled {
            break;
        }
        batch.open()?;
        if storage.update_path(identity, path)? {
            counts.moved += 1;
        }
        touched.insert(identity.mailbox_key());
        batch.item_done()?;
        tracker.step();
    }

    if !tracker.cancelled {
        let mut indexed: HashMap<MailboxKey, usize> = storage
            .mailbox_counts()?
            .into_iter()
            .map(|c| {
                let key = MailboxKey {
                    account_id: c.account_id,
                    mailbox: c.mailbox,
                };
                (key, c.count)
            })
            .collect();

        for (mailbox, candidates) in newest_first_by_mailbox(&plan.added) {
            let mut count = indexed.remove(&mailbox).unwrap_or(0);
            let mut excluded = 0usize;

            for (identity, path) in candidates {
                if tracker.cancelled {
                    break;
                }
                if count >= options.max_per_mailbox {
                    excluded += 1;
                    tracker.step();
                    continue;
                }
                batch.open()?;
                if index_file(storage, identity, path)? {
                    counts.added += 1;
                    count += 1;
                    touched.insert(mailbox.clone());
                } else {
                    counts.errors += 1;
                }
                batch.item_done()?;
                tracker.step();
            }

            if excluded > 0 {
                warn!(
                    account = %mailbox.account_id,
                    mailbox = %mailbox.mailbox,
                    cap = options.max_per_mailbox,
                    excluded,
                    "Mailbox reached its cap; older messages not indexed"
                );
                counts.excluded_by_cap += excluded;
            }
        }
    }

    for (identity, path) in refresh {
        if tracker.cancelled {
            break;
        }
        batch.open()?;
        if index_file(storage, identity, path)? {
            counts.updated += 1;
            touched.insert(identity.mailbox_key());
        } else {
            counts.errors += 1;
        }
        batch.item_done()?;
        tracker.step();
    }

    batch.open()?;
    record_sync_state(storage, &touched)?;
    batch.commit()?;

    counts.cancelled = tracker.cancelled;
    info!(
        added = counts.added,
        deleted = counts.deleted,
        moved = counts.moved,
        updated = counts.updated,
        errors = counts.errors,
        excluded_by_cap = counts.excluded_by_cap,
        cancelled = counts.cancelled,
        "Sync applied"
    );
    Ok(counts)
}

/// Parse one file and write it with its attachments.
///
/// `Ok(false)` means the file was skipped for a per-file reason.
fn index_file(storage: &Storage, identity: &Identity, path: &Path) -> Result<bool> {
    let parsed = match parser::parse_message_file(path) {
        Ok(p) => p,
        Err(e) if e.is_per_item() => {
            warn!(identity = %identity, path = %path.display(), error = %e, "Skipping message");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    let record = MessageRecord::from_parsed(identity.clone(), path, &parsed);
    let rowid = storage.upsert_message(&record)?;
    storage.upsert_attachments(rowid, &parsed.attachments)?;
    Ok(true)
}

/// Group additions by mailbox, newest modification time first.
///
/// Files whose mtime cannot be read sort last.
fn newest_first_by_mailbox(
    added: &[(Identity, PathBuf)],
) -> BTreeMap<MailboxKey, Vec<(&Identity, &PathBuf)>> {
    let mut groups: BTreeMap<MailboxKey, Vec<_>> = BTreeMap::new();
    for (identity, path) in added {
        groups
            .entry(identity.mailbox_key())
            .or_default()
            .push((modified_time(path), identity, path));
    }

    groups
        .into_iter()
        .map(|(key, mut entries)| {
            entries.sort_by_key(|(mtime, identity, _)| (Reverse(*mtime), *identity));
            let ordered = entries.into_iter().map(|(_, i, p)| (i, p)).collect();
            (key, ordered)
        })
        .collect()
}

fn record_sync_state(storage: &Storage, touched: &BTreeSet<MailboxKey>) -> Result<()> {
    let now = Utc::now();
    if touched.is_empty() {
        return storage.record_sync_state(GLOBAL_SYNC_ACCOUNT, GLOBAL_SYNC_MAILBOX, now, 0);
    }
    for key in touched {
        let count = storage.mailbox_count(&key.account_id, &key.mailbox)?;
        storage.record_sync_state(&key.account_id, &key.mailbox, now, count)?;
    }
    Ok(())
}

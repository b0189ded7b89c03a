//! Reconciliation: diff the disk inventory against the stored one and apply
//! the minimal set of index writes.

pub mod apply;
pub mod diff;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::index::storage::Storage;
use crate::model::identity::{Identity, Inventory};
use crate::store::layout::is_excluded;
use crate::store::scanner::probe;

pub use apply::{apply, ApplyOptions, ChangeCount, Progress, BATCH_SIZE};
pub use diff::{diff, SyncPlan};

/// Work for an incremental pass over a set of touched identities.
#[derive(Debug, Default)]
pub struct IncrementalPlan {
    pub plan: SyncPlan,
    /// Touched identities still on disk and already indexed; re-parsed.
    pub refresh: Vec<(Identity, PathBuf)>,
}

/// Build the plan for identities reported by the watcher.
///
/// `touched` maps each identity to the paths it was seen at; the disk is
/// re-checked here, so stale hints are harmless.
pub fn plan_incremental(
    root: &Path,
    storage: &Storage,
    touched: &HashMap<Identity, Vec<PathBuf>>,
    excluded: &[String],
) -> Result<IncrementalPlan> {
    let relevant: Vec<&Identity> = touched
        .keys()
        .filter(|identity| !is_excluded(&identity.mailbox, excluded))
        .collect();

    let disk: Inventory = relevant
        .iter()
        .filter_map(|identity| {
            let hints = touched.get(*identity)?;
            probe(root, identity, hints).map(|path| ((*identity).clone(), path))
        })
        .collect();
    let stored = storage.query_inventory_for(relevant.iter().copied())?;

    let plan = diff(&disk, &stored);
    let mut refresh: Vec<(Identity, PathBuf)> = disk
        .into_iter()
        .filter(|(identity, _)| stored.contains(identity))
        .collect();
    refresh.sort();

    debug!(
        touched = touched.len(),
        added = plan.added.len(),
        deleted = plan.deleted.len(),
        moved = plan.moved.len(),
        refresh = refresh.len(),
        "Planned incremental sync"
    );
    Ok(IncrementalPlan { plan, refresh })
}

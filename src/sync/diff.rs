//! Inventory diff: the pure half of reconciliation.

use std::path::PathBuf;

use serde::Serialize;

use crate::model::identity::{Identity, Inventory};

/// What has to change in the index to match the disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    /// On disk, not indexed. Carries the disk path.
    pub added: Vec<(Identity, PathBuf)>,
    /// Indexed, gone from disk.
    pub deleted: Vec<Identity>,
    /// In both, with a different path. Carries the new path.
    pub moved: Vec<(Identity, PathBuf)>,
    pub unchanged: usize,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.moved.is_empty()
    }

    /// Number of write operations the plan implies.
    pub fn len(&self) -> usize {
        self.added.len() + self.deleted.len() + self.moved.len()
    }
}

/// Partition every identity of `disk` ∪ `stored` into exactly one category.
///
/// Depends only on key presence and path equality. Output lists are sorted
/// by identity so equal inputs give equal plans.
pub fn diff(disk: &Inventory, stored: &Inventory) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for (identity, disk_path) in disk.iter() {
        match stored.get(identity) {
            None => plan.added.push((identity.clone(), disk_path.to_path_buf())),
            Some(stored_path) if stored_path != disk_path => {
                plan.moved.push((identity.clone(), disk_path.to_path_buf()))
            }
            Some(_) => plan.unchanged += 1,
        }
    }

    plan.deleted = stored
        .identities()
        .filter(|identity| !disk.contains(identity))
        .cloned()
        .collect();

    plan.added.sort();
    plan.moved.sort();
    plan.deleted.sort();
    plan
}

//! Per-inode readers-writer locks.
//!
//! Locks are created on first touch and kept for the life of the mount.
//! Callers that need more than one inode lock must acquire them in
//! ascending inode-number order; [`LockTable::locks_sorted`] hands back the
//! lock handles already ordered for that.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Map from inode number to its lock.
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<u32, Arc<RwLock<()>>>>,
}

impl LockTable {
    pub fn new() -> LockTable {
        LockTable::default()
    }

    /// Lock handle for one inode.
    pub fn lock_for(&self, inode: u32) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(inode)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Lock handles for a set of inodes, deduplicated and sorted ascending.
    /// Acquiring them in the returned order preserves the global lock order.
    pub fn locks_sorted(&self, inodes: &[u32]) -> Vec<Arc<RwLock<()>>> {
        let mut unique: Vec<u32> = inodes.to_vec();
        unique.sort_unstable();
        unique.dedup();
        unique.into_iter().map(|n| self.lock_for(n)).collect()
    }
}

//! In-memory offset ledger.
//!
//! The authoritative per-vBucket stream positions, guarded by a single
//! mutex. Readers take deep-copy snapshots under the lock, so a snapshot is
//! a consistent cut across all vBuckets even while events keep flowing.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::models::{Offset, SeqNo, SnapshotMarker, VbId};

/// A consistent copy of the ledger taken under its lock.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    /// Per-vBucket offsets.
    pub offsets: HashMap<VbId, Offset>,
    /// Per-vBucket dirty flags.
    pub dirty: HashMap<VbId, bool>,
    /// `true` when any flag in `dirty` is set.
    pub any_dirty: bool,
}

#[derive(Debug, Default)]
struct Inner {
    offsets: HashMap<VbId, Offset>,
    dirty: HashMap<VbId, bool>,
    any_dirty: bool,
}

/// Mutex-guarded offset state. The ledger exclusively owns the offsets;
/// every accessor hands out copies.
#[derive(Debug, Default)]
pub struct OffsetLedger {
    inner: Mutex<Inner>,
}

impl OffsetLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the ledger contents wholesale (checkpoint load).
    pub fn install(&self, offsets: HashMap<VbId, Offset>, dirty: HashMap<VbId, bool>) {
        let mut inner = self.inner.lock();
        inner.any_dirty = dirty.values().any(|d| *d);
        inner.offsets = offsets;
        inner.dirty = dirty;
    }

    /// Copy of one vBucket's offset.
    #[must_use]
    pub fn get(&self, vb_id: VbId) -> Option<Offset> {
        self.inner.lock().offsets.get(&vb_id).copied()
    }

    /// Overwrites one vBucket's offset.
    pub fn set(&self, vb_id: VbId, offset: Offset, dirty: bool) {
        let mut inner = self.inner.lock();
        inner.offsets.insert(vb_id, offset);
        inner.dirty.insert(vb_id, dirty);
        if dirty {
            inner.any_dirty = true;
        }
    }

    /// Advances one vBucket's processed position. Always dirties.
    pub fn advance(&self, vb_id: VbId, seq_no: SeqNo) {
        let mut inner = self.inner.lock();
        match inner.offsets.get_mut(&vb_id) {
            Some(offset) => {
                offset.seq_no = seq_no;
                inner.dirty.insert(vb_id, true);
                inner.any_dirty = true;
            }
            None => debug!(vb_id, seq_no, "seq no advance for untracked vbucket"),
        }
    }

    /// Records a snapshot window. Dirties only when the window changed.
    pub fn mark_snapshot(&self, vb_id: VbId, marker: SnapshotMarker) {
        let mut inner = self.inner.lock();
        match inner.offsets.get_mut(&vb_id) {
            Some(offset) => {
                if offset.snapshot != marker {
                    offset.snapshot = marker;
                    inner.dirty.insert(vb_id, true);
                    inner.any_dirty = true;
                }
            }
            None => debug!(vb_id, "snapshot marker for untracked vbucket"),
        }
    }

    /// Consistent deep copy of the whole ledger.
    #[must_use]
    pub fn snapshot(&self) -> LedgerSnapshot {
        let inner = self.inner.lock();
        LedgerSnapshot {
            offsets: inner.offsets.clone(),
            dirty: inner.dirty.clone(),
            any_dirty: inner.any_dirty,
        }
    }

    /// Clears dirty flags for the vBuckets persisted from `saved`, keeping
    /// the flag of any vBucket whose offset moved since the snapshot was
    /// taken (its latest position has not been persisted yet).
    pub fn unmark_dirty(&self, saved: &LedgerSnapshot) {
        let mut inner = self.inner.lock();
        for (vb_id, was_dirty) in &saved.dirty {
            if !was_dirty {
                continue;
            }
            let unchanged = inner.offsets.get(vb_id) == saved.offsets.get(vb_id);
            if unchanged {
                inner.dirty.insert(*vb_id, false);
            }
        }
        inner.any_dirty = inner.dirty.values().any(|d| *d);
    }

    /// Tracked vBuckets, sorted.
    #[must_use]
    pub fn vb_ids(&self) -> Vec<VbId> {
        let mut ids: Vec<VbId> = self.inner.lock().offsets.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

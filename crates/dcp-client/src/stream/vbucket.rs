//! vBucket ownership assignment.
//!
//! Partitions the vBucket ID space across group members into contiguous
//! ranges whose sizes differ by at most one. The assignment is a pure
//! function of `(total_vbuckets, member_number, total_members)`, so every
//! member computes the same ranges without coordination.

use parking_lot::Mutex;
use tracing::info;

use crate::membership::Membership;
use crate::models::VbId;

/// vBucket IDs owned by `membership.member_number` out of `total_vbuckets`.
///
/// Members `1..=num_full_chunks` receive `max_chunk_size` vBuckets, later
/// members one fewer; ranges are contiguous and ascending.
#[must_use]
pub fn partition_vbuckets(total_vbuckets: u16, membership: Membership) -> Vec<VbId> {
    let total = usize::from(total_vbuckets);
    let members = membership.total_members as usize;
    let member = membership.member_number as usize;
    if total == 0 || members == 0 || member == 0 || member > members {
        return Vec::new();
    }

    let max_chunk_size = (total - 1) / members + 1;
    let num_full_chunks = members - (max_chunk_size * members - total);

    let start = if member - 1 <= num_full_chunks {
        (member - 1) * max_chunk_size
    } else {
        num_full_chunks * max_chunk_size + (member - 1 - num_full_chunks) * (max_chunk_size - 1)
    };
    let size = if member <= num_full_chunks {
        max_chunk_size
    } else {
        max_chunk_size - 1
    };

    #[allow(clippy::cast_possible_truncation)]
    (start..start + size).map(|vb| vb as VbId).collect()
}

/// The outcome of recomputing ownership.
#[derive(Debug, Clone, Default)]
pub struct OwnershipChange {
    /// Full owned set under the new membership, ascending.
    pub owned: Vec<VbId>,
    /// Newly owned vBuckets (streams to open).
    pub added: Vec<VbId>,
    /// No-longer-owned vBuckets (streams to close).
    pub removed: Vec<VbId>,
}

/// Tracks this member's owned vBucket set across membership changes.
#[derive(Debug)]
pub struct VBucketDiscovery {
    total_vbuckets: u16,
    previous: Mutex<Vec<VbId>>,
}

impl VBucketDiscovery {
    /// Creates a discovery over `total_vbuckets` with nothing owned yet.
    #[must_use]
    pub fn new(total_vbuckets: u16) -> Self {
        Self {
            total_vbuckets,
            previous: Mutex::new(Vec::new()),
        }
    }

    /// Recomputes ownership under `membership` and reports the diff
    /// against the previously owned set.
    pub fn rebalance(&self, membership: Membership) -> OwnershipChange {
        let owned = partition_vbuckets(self.total_vbuckets, membership);
        let mut previous = self.previous.lock();

        let added: Vec<VbId> = owned
            .iter()
            .filter(|vb| !previous.contains(vb))
            .copied()
            .collect();
        let removed: Vec<VbId> = previous
            .iter()
            .filter(|vb| !owned.contains(vb))
            .copied()
            .collect();
        *previous = owned.clone();

        info!(
            membership = %membership,
            owned = owned.len(),
            added = added.len(),
            removed = removed.len(),
            "vbucket ownership recomputed"
        );

        OwnershipChange {
            owned,
            added,
            removed,
        }
    }

    /// Currently owned vBuckets.
    #[must_use]
    pub fn owned(&self) -> Vec<VbId> {
        self.previous.lock().clone()
    }
}

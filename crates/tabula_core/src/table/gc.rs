//! Row garbage collection bookkeeping.

use crate::types::{CommitId, RowId};
use parking_lot::Mutex;

/// Tracks committed-removed rows until no open transaction can see them.
///
/// A row removed by commit `c` stays readable by transactions whose
/// snapshot predates `c`. It becomes reclaimable once the oldest open
/// snapshot is at or after `c`. Rows abandoned by a rollback were never
/// visible to anyone else and are queued with [`CommitId::ZERO`].
#[derive(Debug, Default)]
pub struct RowGarbageCollector {
    pending: Mutex<Vec<(CommitId, RowId)>>,
}

impl RowGarbageCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues rows removed by `commit_id`.
    pub fn mark_removed(&self, commit_id: CommitId, rows: impl IntoIterator<Item = RowId>) {
        self.pending
            .lock()
            .extend(rows.into_iter().map(|r| (commit_id, r)));
    }

    /// Queues rows abandoned by a rollback.
    pub fn mark_abandoned(&self, rows: impl IntoIterator<Item = RowId>) {
        self.mark_removed(CommitId::ZERO, rows);
    }

    /// Number of rows waiting to be reclaimed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Removes and returns the rows no snapshot at or after `min_snapshot`
    /// can see.
    pub fn take_reclaimable(&self, min_snapshot: CommitId) -> Vec<RowId> {
        let mut pending = self.pending.lock();
        let mut ready = Vec::new();
        pending.retain(|(commit, row)| {
            if *commit <= min_snapshot {
                ready.push(*row);
                false
            } else {
                true
            }
        });
        ready.sort_unstable();
        ready.dedup();
        ready
    }

    /// Puts rows back after a failed reclaim.
    pub fn requeue(&self, rows: impl IntoIterator<Item = RowId>) {
        self.mark_abandoned(rows);
    }
}

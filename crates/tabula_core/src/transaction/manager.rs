//! Transaction manager.

use crate::types::{CommitId, TransactionId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out transaction ids and commit ids and tracks open snapshots.
///
/// ## Commit Lock
///
/// One lock serializes snapshot creation and the whole
/// check-and-apply sequence of a commit, so conflict checks see every
/// journal committed since a snapshot at once. Readers and writers working
/// inside their own snapshots never take it.
#[derive(Debug)]
pub struct TransactionManager {
    /// Next transaction ID.
    next_txid: AtomicU64,
    /// Last published commit.
    last_commit: AtomicU64,
    /// Open transactions and the commit their snapshot sees.
    open: Mutex<BTreeMap<TransactionId, CommitId>>,
    /// Serializes commits.
    commit_lock: Mutex<()>,
}

impl TransactionManager {
    /// Creates a manager whose last commit is `last_commit`.
    #[must_use]
    pub fn new(last_commit: CommitId) -> Self {
        Self {
            next_txid: AtomicU64::new(1),
            last_commit: AtomicU64::new(last_commit.as_u64()),
            open: Mutex::new(BTreeMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    /// Acquires the commit lock.
    pub fn commit_lock(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Registers a new transaction seeing everything committed so far.
    ///
    /// Callers hold the commit lock so the snapshot and the table states
    /// they capture agree.
    pub fn begin(&self) -> (TransactionId, CommitId) {
        let id = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        let snapshot = self.last_commit();
        self.open.lock().insert(id, snapshot);
        (id, snapshot)
    }

    /// Unregisters a finished transaction.
    pub fn finish(&self, id: TransactionId) {
        self.open.lock().remove(&id);
    }

    /// Last published commit.
    #[must_use]
    pub fn last_commit(&self) -> CommitId {
        CommitId::new(self.last_commit.load(Ordering::SeqCst))
    }

    /// The id the next commit will get.
    #[must_use]
    pub fn next_commit_id(&self) -> CommitId {
        self.last_commit().next()
    }

    /// Publishes `commit_id` as the latest commit.
    pub fn publish(&self, commit_id: CommitId) {
        self.last_commit.store(commit_id.as_u64(), Ordering::SeqCst);
    }

    /// Oldest snapshot still open, or the last commit if none is.
    ///
    /// Anything committed at or before this point is invisible to no one.
    #[must_use]
    pub fn min_snapshot(&self) -> CommitId {
        self.open
            .lock()
            .values()
            .min()
            .copied()
            .unwrap_or_else(|| self.last_commit())
    }

    /// Number of open transactions.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }
}

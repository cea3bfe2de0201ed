//! Database statistics.
//!
//! Counters are updated by the commit path, the master tables and the
//! garbage collector, and can be read at any time through
//! [`crate::Database::stats`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use tabula_core::Database;
//!
//! let db = Database::open_in_memory()?;
//! // ... run transactions ...
//! let stats = db.stats();
//! println!("Committed: {}", stats.transactions_committed);
//! println!("Conflicts: {}", stats.conflicts);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Database statistics and metrics.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    // Transaction counters
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    transactions_rolled_back: AtomicU64,
    conflicts: AtomicU64,
    constraint_violations: AtomicU64,

    // Row counters
    rows_added: AtomicU64,
    rows_removed: AtomicU64,
    rows_reclaimed: AtomicU64,

    // Cell cache
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    checkpoints: AtomicU64,
}

impl DatabaseStats {
    /// Creates a new stats instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a commit that failed its checks.
    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_rollback(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_constraint_violation(&self) {
        self.constraint_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rows_added(&self, count: u64) {
        self.rows_added.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_rows_removed(&self, count: u64) {
        self.rows_removed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_rows_reclaimed(&self, count: u64) {
        self.rows_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the total number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of commits aborted by a conflict or constraint.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Returns the number of explicit rollbacks.
    pub fn transactions_rolled_back(&self) -> u64 {
        self.transactions_rolled_back.load(Ordering::Relaxed)
    }

    /// Returns the number of serialization conflicts detected.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Returns the number of constraint violations detected.
    pub fn constraint_violations(&self) -> u64 {
        self.constraint_violations.load(Ordering::Relaxed)
    }

    /// Returns the number of rows written.
    pub fn rows_added(&self) -> u64 {
        self.rows_added.load(Ordering::Relaxed)
    }

    /// Returns the number of row removals committed.
    pub fn rows_removed(&self) -> u64 {
        self.rows_removed.load(Ordering::Relaxed)
    }

    /// Returns the number of rows reclaimed by garbage collection.
    pub fn rows_reclaimed(&self) -> u64 {
        self.rows_reclaimed.load(Ordering::Relaxed)
    }

    /// Returns the number of cell cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Returns the number of cell cache misses.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Returns the total number of checkpoints.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            transactions_rolled_back: self.transactions_rolled_back(),
            conflicts: self.conflicts(),
            constraint_violations: self.constraint_violations(),
            rows_added: self.rows_added(),
            rows_removed: self.rows_removed(),
            rows_reclaimed: self.rows_reclaimed(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            checkpoints: self.checkpoints(),
        }
    }
}

/// A point-in-time snapshot of database statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Commits aborted by a conflict or constraint violation.
    pub transactions_aborted: u64,
    /// Explicit rollbacks.
    pub transactions_rolled_back: u64,
    /// Serialization conflicts detected.
    pub conflicts: u64,
    /// Constraint violations detected.
    pub constraint_violations: u64,
    /// Rows written.
    pub rows_added: u64,
    /// Row removals committed.
    pub rows_removed: u64,
    /// Rows reclaimed by garbage collection.
    pub rows_reclaimed: u64,
    /// Cell cache hits.
    pub cache_hits: u64,
    /// Cell cache misses.
    pub cache_misses: u64,
    /// Checkpoints issued.
    pub checkpoints: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = DatabaseStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_transactions() {
        let stats = DatabaseStats::new();

        stats.record_transaction_start();
        stats.record_transaction_start();
        stats.record_transaction_commit();
        stats.record_transaction_abort();
        stats.record_conflict();

        let snap = stats.snapshot();
        assert_eq!(snap.transactions_started, 2);
        assert_eq!(snap.transactions_committed, 1);
        assert_eq!(snap.transactions_aborted, 1);
        assert_eq!(snap.conflicts, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(DatabaseStats::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_rows_added(1);
                    s.record_cache_hit();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.rows_added(), 800);
        assert_eq!(stats.cache_hits(), 800);
    }
}

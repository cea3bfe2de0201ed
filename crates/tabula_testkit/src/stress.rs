//! Stress tests for Tabula.
//!
//! These tests verify behavior under heavy load and concurrent access.

use crate::fixtures::{item, populate_items, ITEMS};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tabula_core::{CoreError, Database, RowId};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Failures that were serialization conflicts.
    pub conflicts: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            conflicts: 0,
            duration,
            ops_per_second,
        }
    }

    /// Sets the number of conflicts among the failures.
    #[must_use]
    pub fn with_conflicts(mut self, conflicts: usize) -> Self {
        self.conflicts = conflicts;
        self
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {} ({} conflicts)", self.failed_ops, self.conflicts);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Number of rows preloaded for read and delete tests.
    pub row_count: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 10_000,
            threads: 4,
            row_count: 1_000,
        }
    }
}

/// Counts outcomes across threads.
#[derive(Default)]
struct Tally {
    successful: AtomicUsize,
    failed: AtomicUsize,
    conflicts: AtomicUsize,
}

impl Tally {
    fn record<T>(&self, result: &Result<T, CoreError>) {
        match result {
            Ok(_) => {
                self.successful.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if err.is_conflict() {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn finish(&self, start: Instant) -> StressTestResult {
        StressTestResult::new(
            self.successful.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            start.elapsed(),
        )
        .with_conflicts(self.conflicts.load(Ordering::Relaxed))
    }
}

/// Run a sequential insert stress test, one row per transaction.
pub fn stress_sequential_inserts(db: &Database, config: &StressConfig) -> StressTestResult {
    let tally = Tally::default();
    let start = Instant::now();
    for i in 0..config.operations {
        tally.record(&db.transaction(|txn| txn.insert(ITEMS, &item(i as i64, "stress"))));
    }
    tally.finish(start)
}

/// Run a point-read stress test through the `id` index.
pub fn stress_point_reads(db: &Database, config: &StressConfig) -> StressTestResult {
    populate_items(db, config.row_count as i64);
    let tally = Tally::default();
    let start = Instant::now();
    let mut txn = match db.begin() {
        Ok(txn) => txn,
        Err(err) => {
            tally.record::<()>(&Err(err));
            return tally.finish(start);
        }
    };
    for i in 0..config.operations {
        let key = tabula_core::Value::Integer((i % config.row_count.max(1)) as i64);
        tally.record(&txn.table(ITEMS).and_then(|view| view.select_equal(0, &key)));
    }
    tally.finish(start)
}

/// Run a mixed insert/update/delete stress test.
pub fn stress_mixed_operations(db: &Database, config: &StressConfig) -> StressTestResult {
    let tally = Tally::default();
    let mut live: Vec<RowId> = Vec::new();
    let start = Instant::now();
    for i in 0..config.operations {
        if i % 3 == 0 || live.is_empty() {
            let result = db.transaction(|txn| txn.insert(ITEMS, &item(i as i64, "mixed")));
            if let Ok(row) = &result {
                live.push(*row);
            }
            tally.record(&result);
        } else if i % 3 == 1 {
            let slot = i % live.len();
            let result = db.transaction(|txn| txn.update(ITEMS, live[slot], &item(i as i64, "updated")));
            if let Ok(row) = &result {
                live[slot] = *row;
            }
            tally.record(&result);
        } else {
            let row = live.swap_remove(i % live.len());
            tally.record(&db.transaction(|txn| txn.delete(ITEMS, row)));
        }
    }
    tally.finish(start)
}

/// Run concurrent inserters. Inserts never conflict, so every operation
/// should succeed.
pub fn stress_concurrent_writers(db: Arc<Database>, config: &StressConfig) -> StressTestResult {
    let tally = Arc::new(Tally::default());
    let ops_per_thread = config.operations / config.threads.max(1);
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let db = Arc::clone(&db);
            let tally = Arc::clone(&tally);
            thread::spawn(move || {
                for i in 0..ops_per_thread {
                    let id = (t * ops_per_thread + i) as i64;
                    tally.record(&db.transaction(|txn| txn.insert(ITEMS, &item(id, "concurrent"))));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    tally.finish(start)
}

/// Run threads that all try to delete the same preloaded rows. Each row
/// must be deleted by exactly one committed transaction.
pub fn stress_contended_deletes(db: Arc<Database>, config: &StressConfig) -> StressTestResult {
    let rows = Arc::new(populate_items(&db, config.row_count as i64));
    let tally = Arc::new(Tally::default());
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let db = Arc::clone(&db);
            let rows = Arc::clone(&rows);
            let tally = Arc::clone(&tally);
            thread::spawn(move || {
                for i in 0..rows.len() {
                    let row = rows[(i + t) % rows.len()];
                    tally.record(&db.transaction(|txn| txn.delete(ITEMS, row)));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }
    tally.finish(start)
}

/// Run a transaction abort stress test: every other transaction fails
/// after writing.
pub fn stress_transaction_aborts(db: &Database, config: &StressConfig) -> StressTestResult {
    let tally = Tally::default();
    let start = Instant::now();
    for i in 0..config.operations {
        let should_fail = i % 2 == 0;
        tally.record(&db.transaction(|txn| {
            txn.insert(ITEMS, &item(i as i64, "abort"))?;
            if should_fail {
                Err(CoreError::invalid_operation("intentional"))
            } else {
                Ok(())
            }
        }));
    }
    tally.finish(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{create_items, visible_rows, with_items_db, TestDatabase};

    fn small_config() -> StressConfig {
        StressConfig {
            operations: 200,
            threads: 4,
            row_count: 50,
        }
    }

    fn shared_items_db() -> Arc<Database> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        create_items(&db);
        db
    }

    #[test]
    fn sequential_inserts() {
        with_items_db(|db| {
            let result = stress_sequential_inserts(db, &small_config());
            assert_eq!(result.successful_ops, 200);
            assert_eq!(visible_rows(db, ITEMS), 200);
        });
    }

    #[test]
    fn point_reads() {
        with_items_db(|db| {
            let result = stress_point_reads(db, &small_config());
            assert_eq!(result.failed_ops, 0);
        });
    }

    #[test]
    fn mixed_operations_keep_tables_consistent() {
        let db = TestDatabase::memory();
        create_items(&db);
        let result = stress_mixed_operations(&db, &small_config());
        assert_eq!(result.failed_ops, 0);
        for report in db.verify().unwrap() {
            assert!(report.is_healthy(), "{:?}", report.issues);
        }
    }

    #[test]
    fn concurrent_writers_all_commit() {
        let db = shared_items_db();
        let result = stress_concurrent_writers(Arc::clone(&db), &small_config());
        assert_eq!(result.successful_ops, 200);
        assert_eq!(visible_rows(&db, ITEMS), 200);
    }

    #[test]
    fn contended_deletes_remove_each_row_once() {
        let db = shared_items_db();
        let config = small_config();
        let result = stress_contended_deletes(Arc::clone(&db), &config);
        assert_eq!(result.successful_ops, config.row_count);
        assert_eq!(result.total_ops, config.row_count * config.threads);
        assert_eq!(visible_rows(&db, ITEMS), 0);
        assert_eq!(db.stats().rows_removed, config.row_count as u64);
    }

    #[test]
    fn aborted_transactions_leave_nothing() {
        with_items_db(|db| {
            let result = stress_transaction_aborts(db, &small_config());
            assert_eq!(result.successful_ops, 100);
            assert_eq!(result.failed_ops, 100);
            assert_eq!(visible_rows(db, ITEMS), 100);
            db.collect_garbage().unwrap();
            assert_eq!(db.master_table(ITEMS).unwrap().slot_summary().uncommitted, 0);
        });
    }
}

//! Cross-crate integration test helpers.
//!
//! Provides a model-checked harness and scenario checks that exercise the
//! table engine end to end.

use crate::fixtures::{create_items, item, TestDatabase, ITEMS};
use crate::generators::TableOperation;
use std::collections::BTreeMap;
use tabula_core::{ConflictKind, Database, RowId, Value};

/// A test harness for integration testing.
///
/// Every committed change is mirrored in a plain map so the table can be
/// checked against it at any point.
pub struct IntegrationHarness {
    /// The database instance.
    pub db: TestDatabase,
    rows: BTreeMap<RowId, Vec<Value>>,
}

impl IntegrationHarness {
    /// Creates a new integration harness with an in-memory database.
    pub fn new() -> Self {
        Self::with_db(TestDatabase::memory())
    }

    /// Creates a harness over `db`, creating the `items` table.
    pub fn with_db(db: TestDatabase) -> Self {
        create_items(&db);
        Self {
            db,
            rows: BTreeMap::new(),
        }
    }

    /// Inserts an item in its own transaction and tracks it.
    pub fn insert(&mut self, id: i64, name: &str) -> RowId {
        let values = item(id, name);
        let row = self
            .db
            .transaction(|txn| txn.insert(ITEMS, &values))
            .expect("Failed to insert item");
        self.rows.insert(row, values);
        row
    }

    /// Renames a tracked item and returns its new row id.
    pub fn update(&mut self, row: RowId, name: &str) -> RowId {
        let mut values = self.rows.remove(&row).expect("row is not tracked");
        values[1] = Value::Text(name.to_owned());
        let replacement = self
            .db
            .transaction(|txn| txn.update(ITEMS, row, &values))
            .expect("Failed to update item");
        self.rows.insert(replacement, values);
        replacement
    }

    /// Deletes a tracked item.
    pub fn delete(&mut self, row: RowId) {
        self.db
            .transaction(|txn| txn.delete(ITEMS, row))
            .expect("Failed to delete item");
        self.rows.remove(&row);
    }

    /// Runs `ops` in a chain of transactions, tracking what commits.
    pub fn run_workload(&mut self, ops: &[TableOperation]) {
        let mut working = self.rows.clone();
        let mut txn = self.db.begin().expect("Failed to begin transaction");
        for op in ops {
            match op {
                TableOperation::Insert { id, name } => {
                    let values = item(*id, name);
                    let row = txn.insert(ITEMS, &values).expect("Failed to insert item");
                    working.insert(row, values);
                }
                TableOperation::Update { position, name } => {
                    let Some(row) = nth_row(&working, *position) else {
                        continue;
                    };
                    let mut values = working.remove(&row).expect("row is live");
                    values[1] = Value::Text(name.clone());
                    let replacement = txn.update(ITEMS, row, &values).expect("Failed to update item");
                    working.insert(replacement, values);
                }
                TableOperation::Delete { position } => {
                    let Some(row) = nth_row(&working, *position) else {
                        continue;
                    };
                    txn.delete(ITEMS, row).expect("Failed to delete item");
                    working.remove(&row);
                }
                TableOperation::Commit => {
                    txn.commit().expect("Failed to commit");
                    self.rows = working.clone();
                    txn = self.db.begin().expect("Failed to begin transaction");
                }
                TableOperation::Rollback => {
                    txn.rollback().expect("Failed to roll back");
                    working = self.rows.clone();
                    txn = self.db.begin().expect("Failed to begin transaction");
                }
            }
        }
        txn.commit().expect("Failed to commit");
        self.rows = working;
    }

    /// Verifies the table matches every tracked row and passes the
    /// consistency checks.
    pub fn verify_all(&self) {
        {
            let mut txn = self.db.begin().expect("Failed to begin transaction");
            let view = txn.table(ITEMS).expect("items table is missing");
            let rows = view.row_ids().expect("Failed to list rows");
            assert_eq!(
                rows,
                self.rows.keys().copied().collect::<Vec<_>>(),
                "visible rows differ from the model"
            );
            for (row, expected) in &self.rows {
                assert_eq!(&view.get_row(*row).expect("Failed to read row"), expected, "row {row} differs");
            }
        }
        for report in self.db.verify().expect("Failed to verify tables") {
            assert!(report.is_healthy(), "{}: {:?}", report.table, report.issues);
        }
    }

    /// Number of tracked rows.
    pub fn tracked_count(&self) -> usize {
        self.rows.len()
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn nth_row(rows: &BTreeMap<RowId, Vec<Value>>, position: usize) -> Option<RowId> {
    if rows.is_empty() {
        None
    } else {
        rows.keys().nth(position % rows.len()).copied()
    }
}

/// Cross-component scenario checks over a database with an `items`
/// table.
pub mod scenarios {
    use super::*;

    /// A transaction does not see commits made after it began.
    pub fn test_snapshot_isolation(db: &Database) {
        let mut reader = db.begin().expect("Failed to begin reader");
        let before = reader.table(ITEMS).unwrap().row_count().unwrap();

        db.transaction(|txn| txn.insert(ITEMS, &item(1000, "late")))
            .expect("Failed to insert");

        assert_eq!(reader.table(ITEMS).unwrap().row_count().unwrap(), before);
        let mut fresh = db.begin().expect("Failed to begin");
        assert_eq!(fresh.table(ITEMS).unwrap().row_count().unwrap(), before + 1);
    }

    /// Rolled-back rows never become visible and their slots are
    /// reclaimed.
    pub fn test_rollback(db: &Database) {
        let before = crate::fixtures::visible_rows(db, ITEMS);
        let mut txn = db.begin().expect("Failed to begin");
        for id in 0..5 {
            txn.insert(ITEMS, &item(2000 + id, "discarded")).unwrap();
        }
        txn.rollback().expect("Failed to roll back");

        assert_eq!(crate::fixtures::visible_rows(db, ITEMS), before);
        db.collect_garbage().expect("Failed to collect garbage");
        let table = db.master_table(ITEMS).unwrap();
        assert_eq!(table.slot_summary().uncommitted, 0);
        assert_eq!(table.pending_reclaim(), 0);
    }

    /// Index lookups agree with a full scan.
    pub fn test_index_consistency(db: &Database) {
        let mut txn = db.begin().expect("Failed to begin");
        let view = txn.table(ITEMS).unwrap();
        let rows = view.row_ids().unwrap();
        for row in rows {
            let id = view.get_cell(row, 0).unwrap();
            let found = view.select_equal(0, &id).unwrap();
            assert!(found.contains(&row), "index lookup of {id} missed {row}");
        }
    }

    /// Two transactions deleting the same row: exactly one commits.
    pub fn test_delete_clash(db: &Database) {
        let row = db
            .transaction(|txn| txn.insert(ITEMS, &item(3000, "contested")))
            .expect("Failed to insert");
        let mut first = db.begin().unwrap();
        let mut second = db.begin().unwrap();
        first.delete(ITEMS, row).unwrap();
        second.delete(ITEMS, row).unwrap();

        first.commit().expect("first delete must commit");
        let err = second.commit().expect_err("second delete must clash");
        assert_eq!(err.conflict_kind(), Some(ConflictKind::RowClash));
    }
}

#[cfg(test)]
mod tests {
    use super::scenarios::*;
    use super::*;
    use crate::fixtures::with_items_db;
    use crate::generators::{operation_sequence_strategy, PropTestConfig};
    use proptest::prelude::*;

    #[test]
    fn test_integration_harness() {
        let mut harness = IntegrationHarness::new();
        let a = harness.insert(1, "a");
        let b = harness.insert(2, "b");
        let b = harness.update(b, "bee");
        harness.delete(a);
        harness.verify_all();
        assert_eq!(harness.tracked_count(), 1);
        assert_ne!(a, b);
    }

    #[test]
    fn harness_over_file_database() {
        let mut harness = IntegrationHarness::with_db(TestDatabase::file());
        for id in 0..20 {
            harness.insert(id, "x");
        }
        harness.verify_all();
    }

    #[test]
    fn test_snapshot_isolation_scenario() {
        with_items_db(test_snapshot_isolation);
    }

    #[test]
    fn test_rollback_scenario() {
        with_items_db(test_rollback);
    }

    #[test]
    fn test_index_consistency_scenario() {
        with_items_db(|db| {
            crate::fixtures::populate_items(db, 50);
            test_index_consistency(db);
        });
    }

    #[test]
    fn test_delete_clash_scenario() {
        with_items_db(test_delete_clash);
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn random_workloads_match_model(ops in operation_sequence_strategy(1, 60)) {
            let mut harness = IntegrationHarness::new();
            harness.run_workload(&ops);
            harness.verify_all();
        }
    }
}

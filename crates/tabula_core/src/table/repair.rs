//! Table consistency checks and the repair maintenance operation.

use super::master::MasterTable;
use super::scheme::{ColumnScheme, ROW_LIST};
use super::slots::RowStatus;
use crate::error::CoreResult;
use crate::types::RowId;
use std::collections::BTreeSet;

/// Result of checking one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableReport {
    /// Table name.
    pub table: String,
    /// Slots ever allocated.
    pub slots: usize,
    /// Committed rows.
    pub live_rows: usize,
    /// Free slots according to the slot states.
    pub free_slots: usize,
    /// Slots reachable through the free chain.
    pub free_chain_length: usize,
    /// Removed or abandoned rows waiting for reclaim.
    pub pending_reclaim: usize,
    /// Problems found, one line each.
    pub issues: Vec<String>,
}

impl TableReport {
    /// Whether no problems were found.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

impl MasterTable {
    /// Checks the slot list, its free chain and every index against the
    /// committed rows.
    ///
    /// # Errors
    ///
    /// Returns an error only if storage cannot be read; inconsistencies are
    /// reported in the [`TableReport`].
    pub fn verify(&self) -> CoreResult<TableReport> {
        let summary = self.slot_summary();
        let mut report = TableReport {
            table: self.name().to_owned(),
            slots: summary.slots,
            live_rows: summary.committed_added,
            free_slots: summary.free,
            pending_reclaim: self.pending_reclaim(),
            ..TableReport::default()
        };

        match self.free_chain() {
            Ok(chain) => {
                report.free_chain_length = chain.len();
                if chain.len() != summary.free {
                    report.issues.push(format!(
                        "free chain links {} slots, {} slots are free",
                        chain.len(),
                        summary.free
                    ));
                }
            }
            Err(err) => report.issues.push(format!("free chain unreadable: {err}")),
        }

        let live: BTreeSet<u32> = self
            .rows_by_status()
            .into_iter()
            .filter(|(_, status)| *status == RowStatus::CommittedAdded)
            .map(|(row, _)| row.as_u32())
            .collect();
        let mut set = self.create_index_set()?;
        let listed: BTreeSet<u32> = set.get_index(ROW_LIST)?.iter().collect();
        for row in listed.difference(&live) {
            report
                .issues
                .push(format!("row list holds {} which is not a committed row", RowId::new(*row)));
        }
        for row in live.difference(&listed) {
            report
                .issues
                .push(format!("committed {} missing from the row list", RowId::new(*row)));
        }

        for (column, index) in self.schema().indexed_columns() {
            let list = set.get_index(index)?;
            let members: BTreeSet<u32> = list.iter().collect();
            if members != live {
                report.issues.push(format!(
                    "index of column {} holds {} rows, {} are committed",
                    self.schema().columns[column].name,
                    members.len(),
                    live.len()
                ));
                continue;
            }
            let mut previous = None;
            for element in list.iter() {
                let key = (self.get_cell(RowId::new(element), column)?, element);
                if previous.as_ref().is_some_and(|p| *p >= key) {
                    report.issues.push(format!(
                        "index of column {} is out of order at {}",
                        self.schema().columns[column].name,
                        RowId::new(element)
                    ));
                    break;
                }
                previous = Some(key);
            }
        }

        if !report.is_healthy() {
            tracing::warn!(table = %self.name(), issues = report.issues.len(), "table failed verification");
        }
        Ok(report)
    }

    /// Rebuilds the free chain and every index from the slot states.
    ///
    /// Only safe while no transaction holds a snapshot of the table.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read or written.
    pub fn repair(&self) -> CoreResult<TableReport> {
        let free = self.rebuild_free_chain()?;
        let live: Vec<RowId> = self
            .rows_by_status()
            .into_iter()
            .filter(|(_, status)| *status == RowStatus::CommittedAdded)
            .map(|(row, _)| row)
            .collect();

        let mut set = self.create_index_set()?;
        let list = set.get_index(ROW_LIST)?;
        list.clear();
        for row in &live {
            list.insert_sort(row.as_u32());
        }
        for (column, index) in self.schema().indexed_columns() {
            let list = set.get_index(index)?;
            list.clear();
            let scheme = ColumnScheme::new(self, column);
            for row in &live {
                scheme.insert(list, *row)?;
            }
        }
        self.commit_index_set(&set)?;
        drop(set);

        tracing::info!(table = %self.name(), rows = live.len(), free, "repaired table");
        self.verify()
    }
}

#[cfg(test)]
mod tests {
    use crate::blob::InMemoryBlobStore;
    use crate::schema::{ColumnDef, TableSchema};
    use crate::stats::DatabaseStats;
    use crate::table::journal::{JournalCommand, MasterTableJournal};
    use crate::table::master::{MasterTable, TableEnv};
    use crate::table::scheme::apply_entries;
    use crate::types::{CommitId, TableId};
    use crate::value::{ColumnType, Value};
    use std::sync::Arc;
    use tabula_storage::HeapAreaStore;

    fn populated() -> Arc<MasterTable> {
        let env = TableEnv {
            store: Arc::new(HeapAreaStore::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
            stats: Arc::new(DatabaseStats::new()),
            index_block_size: 4,
            cell_cache_capacity: 0,
        };
        let schema = TableSchema::new("items")
            .column(ColumnDef::new("sku", ColumnType::Integer).indexed());
        let table = MasterTable::create(&env, TableId::new(1), schema).unwrap();
        let mut journal = MasterTableJournal::new(table.id());
        for sku in [30, 10, 20] {
            let row = table.add_row(&[Value::Integer(sku)]).unwrap();
            journal.add_entry(JournalCommand::AddRow, row);
        }
        let mut set = table.create_index_set().unwrap();
        apply_entries(&table, &mut set, journal.entries()).unwrap();
        table
            .commit_transaction_change(CommitId::new(1), journal, &set)
            .unwrap();
        table
    }

    #[test]
    fn healthy_table_verifies() {
        let table = populated();
        let report = table.verify().unwrap();
        assert!(report.is_healthy(), "{:?}", report.issues);
        assert_eq!(report.live_rows, 3);
        assert_eq!(report.slots, 3);
    }

    #[test]
    fn repair_rebuilds_lost_indexes() {
        let table = populated();
        let mut set = table.create_index_set().unwrap();
        set.get_index(0).unwrap().clear();
        set.get_index(1).unwrap().remove_at(0);
        table.commit_index_set(&set).unwrap();
        drop(set);

        let damaged = table.verify().unwrap();
        assert!(!damaged.is_healthy());
        assert_eq!(damaged.issues.len(), 4);

        let repaired = table.repair().unwrap();
        assert!(repaired.is_healthy(), "{:?}", repaired.issues);
        let mut set = table.create_index_set().unwrap();
        assert_eq!(set.get_index(0).unwrap().len(), 3);
    }
}

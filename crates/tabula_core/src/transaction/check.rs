//! The read-only view a commit validates against.

use super::constraint::ConstraintLookup;
use crate::error::{CoreError, CoreResult};
use crate::index::IndexSet;
use crate::schema::TableSchema;
use crate::table::scheme::{apply_entries, rows_matching_in};
use crate::table::{MasterTable, TableView};
use crate::types::{CommitId, RowId};
use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

struct CheckTable {
    table: Arc<MasterTable>,
    set: IndexSet,
}

/// What the database will look like if a commit proceeds.
///
/// Dropped tables are absent. A changed table nobody else committed to
/// since the snapshot reuses the transaction's own index lists; otherwise
/// the transaction's journal is replayed onto the latest committed lists.
/// Unchanged tables, and committed tables the transaction never saw, show
/// their latest committed state.
pub(crate) struct CheckTransaction {
    tables: BTreeMap<String, CheckTable>,
}

impl CheckTransaction {
    /// Builds the check view over `views` plus the latest state of
    /// `others`.
    pub(crate) fn build<'a>(
        views: impl IntoIterator<Item = &'a mut TableView>,
        others: impl IntoIterator<Item = Arc<MasterTable>>,
        snapshot: CommitId,
    ) -> CoreResult<Self> {
        let mut tables = BTreeMap::new();
        for view in views {
            let table = Arc::clone(view.table());
            let set = if !view.is_changed() {
                table.create_index_set()?
            } else if table.changed_since(snapshot) {
                let mut set = table.create_index_set()?;
                apply_entries(&table, &mut set, view.journal().entries())?;
                tracing::debug!(table = %table.name(), entries = view.journal().len(), "replayed journal onto latest indexes");
                set
            } else {
                view.prepare_commit()?;
                view.index_set().duplicate()
            };
            tables.insert(table.name().to_owned(), CheckTable { table, set });
        }
        for table in others {
            if !tables.contains_key(table.name()) {
                let set = table.create_index_set()?;
                tables.insert(table.name().to_owned(), CheckTable { table, set });
            }
        }
        Ok(Self { tables })
    }

    fn get(&mut self, table: &str) -> CoreResult<&mut CheckTable> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| CoreError::table_not_found(table))
    }

    /// The index set to commit for `table`.
    pub(crate) fn index_set(&self, table: &str) -> CoreResult<&IndexSet> {
        self.tables
            .get(table)
            .map(|t| &t.set)
            .ok_or_else(|| CoreError::table_not_found(table))
    }
}

impl ConstraintLookup for CheckTransaction {
    fn schema(&self, table: &str) -> CoreResult<Arc<TableSchema>> {
        self.tables
            .get(table)
            .map(|t| Arc::clone(t.table.schema()))
            .ok_or_else(|| CoreError::table_not_found(table))
    }

    fn rows_matching(&mut self, table: &str, columns: &[usize], values: &[Value]) -> CoreResult<Vec<RowId>> {
        let entry = self.get(table)?;
        rows_matching_in(&entry.table, &mut entry.set, columns, values)
    }

    fn read_cell(&mut self, table: &str, row: RowId, column: usize) -> CoreResult<Value> {
        self.get(table)?.table.get_cell(row, column)
    }
}

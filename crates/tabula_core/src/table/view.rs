//! Per-transaction view of a table.

use super::journal::{JournalCommand, MasterTableJournal};
use super::master::MasterTable;
use super::scheme::{self, ColumnScheme, ROW_LIST};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexSet;
use crate::schema::TableSchema;
use crate::types::RowId;
use crate::value::Value;
use std::ops::Bound;
use std::sync::Arc;

/// A transaction's private, mutable view of one table.
///
/// Wraps the shared [`MasterTable`], an index snapshot taken when the
/// transaction began, and the journal of changes made through the view.
/// Index lists are brought up to date lazily: each list remembers how many
/// journal entries it has absorbed and only applies the rest.
pub struct TableView {
    table: Arc<MasterTable>,
    set: IndexSet,
    journal: MasterTableJournal,
    applied: Vec<usize>,
    index_columns: Vec<Option<usize>>,
    selected: bool,
}

impl std::fmt::Debug for TableView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableView")
            .field("table", &self.table.name())
            .field("journal", &self.journal.len())
            .field("selected", &self.selected)
            .finish_non_exhaustive()
    }
}

impl TableView {
    pub(crate) fn new(table: Arc<MasterTable>, set: IndexSet) -> Self {
        let schema = Arc::clone(table.schema());
        let mut index_columns = vec![None; schema.index_count()];
        for (column, index) in schema.indexed_columns() {
            index_columns[index] = Some(column);
        }
        let journal = MasterTableJournal::new(table.id());
        Self {
            applied: vec![0; index_columns.len()],
            table,
            set,
            journal,
            index_columns,
            selected: false,
        }
    }

    /// The shared table behind the view.
    #[must_use]
    pub fn table(&self) -> &Arc<MasterTable> {
        &self.table
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.table.name()
    }

    /// Table schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<TableSchema> {
        self.table.schema()
    }

    /// Position of the column called `name`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if there is no such column.
    pub fn column(&self, name: &str) -> CoreResult<usize> {
        self.schema().require_column(name)
    }

    /// Changes made through this view.
    #[must_use]
    pub fn journal(&self) -> &MasterTableJournal {
        &self.journal
    }

    /// Whether the view holds uncommitted changes.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        !self.journal.is_empty()
    }

    /// Whether rows were read through the view.
    #[must_use]
    pub fn was_selected(&self) -> bool {
        self.selected
    }

    /// Applies pending journal entries to index `index`.
    fn sync(&mut self, index: usize) -> CoreResult<()> {
        let start = self.applied[index];
        let entries = &self.journal.entries()[start..];
        if entries.is_empty() {
            return Ok(());
        }
        let list = self.set.get_index(index)?;
        for (i, entry) in entries.iter().enumerate() {
            match self.index_columns[index] {
                None => scheme::apply_to_row_list(list, entry),
                Some(column) => scheme::apply_to_scheme(&self.table, column, list, entry)?,
            }
            self.applied[index] = start + i + 1;
        }
        Ok(())
    }

    fn sync_all(&mut self) -> CoreResult<()> {
        for index in 0..self.applied.len() {
            self.sync(index)?;
        }
        Ok(())
    }

    fn visible(&mut self, row: RowId) -> CoreResult<bool> {
        self.sync(ROW_LIST)?;
        Ok(self.set.get_index(ROW_LIST)?.contains(row.as_u32()))
    }

    fn require_visible(&mut self, row: RowId) -> CoreResult<()> {
        if self.visible(row)? {
            Ok(())
        } else {
            Err(CoreError::RowNotFound {
                table: self.name().to_owned(),
                row: row.as_u32(),
            })
        }
    }

    /// Number of rows visible to the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub fn row_count(&mut self) -> CoreResult<usize> {
        self.selected = true;
        self.sync(ROW_LIST)?;
        Ok(self.set.get_index(ROW_LIST)?.len())
    }

    /// Whether `row` is visible to the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub fn contains_row(&mut self, row: RowId) -> CoreResult<bool> {
        self.selected = true;
        self.visible(row)
    }

    /// Every visible row, by row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub fn row_ids(&mut self) -> CoreResult<Vec<RowId>> {
        self.selected = true;
        self.sync(ROW_LIST)?;
        Ok(self.set.get_index(ROW_LIST)?.iter().map(RowId::new).collect())
    }

    /// Reads one cell of a visible row.
    ///
    /// # Errors
    ///
    /// Returns `RowNotFound` if the row is not visible to the transaction.
    pub fn get_cell(&mut self, row: RowId, column: usize) -> CoreResult<Value> {
        self.selected = true;
        self.require_visible(row)?;
        self.table.get_cell(row, column)
    }

    /// Reads a visible row.
    ///
    /// # Errors
    ///
    /// Returns `RowNotFound` if the row is not visible to the transaction.
    pub fn get_row(&mut self, row: RowId) -> CoreResult<Vec<Value>> {
        self.selected = true;
        self.require_visible(row)?;
        self.table.get_row(row)
    }

    /// Inserts a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row doesn't match the schema or cannot be
    /// written.
    pub fn add_row(&mut self, values: &[Value]) -> CoreResult<RowId> {
        let row = self.table.add_row(values)?;
        self.journal.add_entry(JournalCommand::AddRow, row);
        Ok(row)
    }

    /// Deletes a visible row.
    ///
    /// # Errors
    ///
    /// Returns `RowNotFound` if the row is not visible to the transaction.
    pub fn remove_row(&mut self, row: RowId) -> CoreResult<()> {
        self.require_visible(row)?;
        self.journal.add_entry(JournalCommand::RemoveRow, row);
        Ok(())
    }

    /// Replaces a visible row with a new version and returns the new row id.
    ///
    /// # Errors
    ///
    /// Returns `RowNotFound` if the row is not visible, or an error if the
    /// new version cannot be written.
    pub fn update_row(&mut self, row: RowId, values: &[Value]) -> CoreResult<RowId> {
        self.require_visible(row)?;
        let replacement = self.table.add_row(values)?;
        self.journal.add_entry(JournalCommand::UpdateRemoveRow, row);
        self.journal.add_entry(JournalCommand::UpdateAddRow, replacement);
        Ok(replacement)
    }

    /// Visible rows whose `column` equals `value`.
    ///
    /// Uses the column's index when it has one and scans otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if a cell or index cannot be read.
    pub fn select_equal(&mut self, column: usize, value: &Value) -> CoreResult<Vec<RowId>> {
        self.select_range(column, Bound::Included(value), Bound::Included(value))
    }

    /// Visible rows whose `column` lies within the bounds, ordered by
    /// `(value, row id)`.
    ///
    /// # Errors
    ///
    /// Returns an error if a cell or index cannot be read.
    pub fn select_range(
        &mut self,
        column: usize,
        lower: Bound<&Value>,
        upper: Bound<&Value>,
    ) -> CoreResult<Vec<RowId>> {
        self.schema().require_column_at(column)?;
        self.selected = true;
        match self.schema().index_number(column) {
            Some(index) => {
                self.sync(index)?;
                let list = self.set.get_index(index)?;
                ColumnScheme::new(&self.table, column).select_range(list, lower, upper)
            }
            None => {
                self.sync(ROW_LIST)?;
                let rows: Vec<RowId> = self.set.get_index(ROW_LIST)?.iter().map(RowId::new).collect();
                scheme::scan_range(&self.table, column, rows, lower, upper)
            }
        }
    }

    /// Undoes the last `n` changes.
    ///
    /// Rows those changes added are hidden and left for the garbage
    /// collector.
    ///
    /// # Errors
    ///
    /// Returns an error if an index cannot be restored.
    pub fn rollback_entries(&mut self, n: usize) -> CoreResult<()> {
        let undone = self.journal.rollback_entries(n);
        let kept = self.journal.len();
        for index in 0..self.applied.len() {
            let applied = self.applied[index];
            if applied <= kept {
                continue;
            }
            let list = self.set.get_index(index)?;
            for (offset, entry) in undone.iter().enumerate().rev() {
                if kept + offset >= applied {
                    continue;
                }
                match self.index_columns[index] {
                    None if entry.command.is_add() => {
                        list.remove_sort(entry.row.as_u32());
                    }
                    None => {
                        list.insert_sort(entry.row.as_u32());
                    }
                    Some(column) => scheme::revert_on_scheme(&self.table, column, list, entry)?,
                }
            }
            self.applied[index] = kept;
        }
        let added: Vec<RowId> = undone
            .iter()
            .filter(|e| e.command.is_add())
            .map(|e| e.row)
            .collect();
        self.table.abandon_rows(&added)
    }

    /// Advances the table's unique id sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence cannot be persisted.
    pub fn next_unique_id(&mut self) -> CoreResult<i64> {
        self.table.next_unique_id()
    }

    /// Visible rows whose cells on `columns` equal `values`, without
    /// counting as a read of the table.
    pub(crate) fn rows_matching(&mut self, columns: &[usize], values: &[Value]) -> CoreResult<Vec<RowId>> {
        self.sync(ROW_LIST)?;
        if let Some(index) = columns.first().and_then(|c| self.schema().index_number(*c)) {
            self.sync(index)?;
        }
        scheme::rows_matching_in(&self.table, &mut self.set, columns, values)
    }

    /// Reads a cell without visibility checks or counting as a read.
    pub(crate) fn read_cell(&self, row: RowId, column: usize) -> CoreResult<Value> {
        self.table.get_cell(row, column)
    }

    /// Brings every index list up to date.
    pub(crate) fn prepare_commit(&mut self) -> CoreResult<()> {
        self.sync_all()
    }

    pub(crate) fn index_set(&self) -> &IndexSet {
        &self.set
    }

    pub(crate) fn take_journal(&mut self) -> MasterTableJournal {
        self.applied.iter_mut().for_each(|a| *a = 0);
        std::mem::replace(&mut self.journal, MasterTableJournal::new(self.table.id()))
    }

    pub(crate) fn into_parts(self) -> (Arc<MasterTable>, IndexSet, MasterTableJournal) {
        (self.table, self.set, self.journal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::schema::ColumnDef;
    use crate::stats::DatabaseStats;
    use crate::table::master::TableEnv;
    use crate::table::slots::RowStatus;
    use crate::types::{CommitId, TableId};
    use crate::value::ColumnType;
    use tabula_storage::HeapAreaStore;

    fn table() -> Arc<MasterTable> {
        let env = TableEnv {
            store: Arc::new(HeapAreaStore::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
            stats: Arc::new(DatabaseStats::new()),
            index_block_size: 8,
            cell_cache_capacity: 32,
        };
        let schema = TableSchema::new("people")
            .column(ColumnDef::new("name", ColumnType::Text).indexed())
            .column(ColumnDef::new("age", ColumnType::Integer));
        MasterTable::create(&env, TableId::new(1), schema).unwrap()
    }

    fn view(table: &Arc<MasterTable>) -> TableView {
        TableView::new(Arc::clone(table), table.create_index_set().unwrap())
    }

    fn commit(view: &mut TableView, commit_id: u64) {
        view.prepare_commit().unwrap();
        let journal = view.take_journal();
        view.table()
            .clone()
            .commit_transaction_change(CommitId::new(commit_id), journal, view.index_set())
            .unwrap();
    }

    #[test]
    fn changes_visible_only_to_own_view() {
        let table = table();
        let mut writer = view(&table);
        let mut reader = view(&table);

        let row = writer.add_row(&["ann".into(), Value::Integer(31)]).unwrap();
        assert_eq!(writer.row_count().unwrap(), 1);
        assert_eq!(writer.get_cell(row, 0).unwrap(), Value::from("ann"));
        assert_eq!(reader.row_count().unwrap(), 0);
        assert!(matches!(
            reader.get_cell(row, 0),
            Err(CoreError::RowNotFound { .. })
        ));

        commit(&mut writer, 1);
        assert_eq!(reader.row_count().unwrap(), 0);
        assert_eq!(view(&table).row_count().unwrap(), 1);
    }

    #[test]
    fn rebuild_is_incremental_and_idempotent() {
        let table = table();
        let mut v = view(&table);
        v.add_row(&["a".into(), Value::Integer(1)]).unwrap();
        v.add_row(&["b".into(), Value::Integer(2)]).unwrap();

        assert_eq!(v.row_count().unwrap(), 2);
        let before = v.row_ids().unwrap();
        assert_eq!(v.row_count().unwrap(), 2);
        assert_eq!(v.row_ids().unwrap(), before);
        assert_eq!(v.applied[ROW_LIST], 2);

        v.add_row(&["c".into(), Value::Integer(3)]).unwrap();
        assert_eq!(v.applied[ROW_LIST], 2);
        assert_eq!(v.row_count().unwrap(), 3);
        assert_eq!(v.applied[ROW_LIST], 3);
    }

    #[test]
    fn update_replaces_row_in_indexes() {
        let table = table();
        let mut v = view(&table);
        let old = v.add_row(&["bob".into(), Value::Integer(40)]).unwrap();
        assert_eq!(v.select_equal(0, &"bob".into()).unwrap(), vec![old]);

        let new = v.update_row(old, &["rob".into(), Value::Integer(41)]).unwrap();
        assert_ne!(old, new);
        assert!(v.select_equal(0, &"bob".into()).unwrap().is_empty());
        assert_eq!(v.select_equal(0, &"rob".into()).unwrap(), vec![new]);
        assert_eq!(v.select_equal(1, &Value::Integer(41)).unwrap(), vec![new]);
        assert!(v.remove_row(old).is_err());
    }

    #[test]
    fn rollback_entries_restores_indexes_and_abandons_rows() {
        let table = table();
        let mut v = view(&table);
        let keep = v.add_row(&["x".into(), Value::Integer(1)]).unwrap();
        assert_eq!(v.row_count().unwrap(), 1);

        let dropped = v.add_row(&["y".into(), Value::Integer(2)]).unwrap();
        v.remove_row(keep).unwrap();
        assert_eq!(v.select_equal(0, &"y".into()).unwrap(), vec![dropped]);

        v.rollback_entries(2).unwrap();
        assert_eq!(v.journal().len(), 1);
        assert_eq!(v.row_ids().unwrap(), vec![keep]);
        assert!(v.select_equal(0, &"y".into()).unwrap().is_empty());
        assert_eq!(v.select_equal(0, &"x".into()).unwrap(), vec![keep]);
        assert_eq!(table.record_type(dropped).unwrap(), RowStatus::CommittedRemoved);
        assert_eq!(table.record_type(keep).unwrap(), RowStatus::Uncommitted);
    }

    #[test]
    fn range_selection_on_unindexed_column() {
        let table = table();
        let mut v = view(&table);
        for (name, age) in [("a", 30), ("b", 20), ("c", 50), ("d", 40)] {
            v.add_row(&[name.into(), Value::Integer(age)]).unwrap();
        }
        let twenty = Value::Integer(20);
        let forty = Value::Integer(40);
        let rows = v
            .select_range(1, Bound::Excluded(&twenty), Bound::Included(&forty))
            .unwrap();
        let ages: Vec<Value> = rows.iter().map(|r| v.get_cell(*r, 1).unwrap()).collect();
        assert_eq!(ages, vec![Value::Integer(30), Value::Integer(40)]);
        assert!(v.was_selected());
    }

    #[test]
    fn writes_alone_do_not_count_as_reads() {
        let table = table();
        let mut v = view(&table);
        let row = v.add_row(&["z".into(), Value::Null]).unwrap();
        v.remove_row(row).unwrap();
        assert!(!v.was_selected());
        assert!(v.rows_matching(&[0], &["z".into()]).unwrap().is_empty());
        assert!(!v.was_selected());
    }
}

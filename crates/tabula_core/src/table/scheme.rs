//! Ordered column lookups over index lists.
//!
//! Index 0 of every table lists its visible rows by row id. Each indexed
//! column owns another list holding the same rows ordered by
//! `(cell value, row id)`, so equal values sit next to each other and the
//! order is total.

use super::journal::JournalEntry;
use super::master::MasterTable;
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexIntegerList, IndexSet};
use crate::types::RowId;
use crate::value::Value;
use std::cmp::Ordering;
use std::ops::Bound;

/// Index number of the row list.
pub const ROW_LIST: usize = 0;

/// Selectable scheme of one indexed column.
pub(crate) struct ColumnScheme<'a> {
    table: &'a MasterTable,
    column: usize,
}

impl<'a> ColumnScheme<'a> {
    pub(crate) fn new(table: &'a MasterTable, column: usize) -> Self {
        Self { table, column }
    }

    fn key_order(&self, element: u32, value: &Value, row: RowId) -> CoreResult<Ordering> {
        let cell = self.table.get_cell(RowId::new(element), self.column)?;
        Ok(cell.cmp(value).then(element.cmp(&row.as_u32())))
    }

    /// Adds `row` at its ordered position.
    pub(crate) fn insert(&self, list: &mut IndexIntegerList, row: RowId) -> CoreResult<()> {
        let value = self.table.get_cell(row, self.column)?;
        match list.binary_search_by(|e| self.key_order(e, &value, row))? {
            Ok(_) => Ok(()),
            Err(pos) => {
                list.insert_at(pos, row.as_u32());
                Ok(())
            }
        }
    }

    /// Removes `row` from its ordered position.
    pub(crate) fn remove(&self, list: &mut IndexIntegerList, row: RowId) -> CoreResult<()> {
        let value = self.table.get_cell(row, self.column)?;
        match list.binary_search_by(|e| self.key_order(e, &value, row))? {
            Ok(pos) => {
                list.remove_at(pos);
                Ok(())
            }
            Err(_) => Err(CoreError::corruption(format!(
                "{row} missing from the index of column {} in {}",
                self.column,
                self.table.name()
            ))),
        }
    }

    /// First position whose cell is not before `bound`.
    fn lower_position(&self, list: &IndexIntegerList, bound: Bound<&Value>) -> CoreResult<usize> {
        let position = match bound {
            Bound::Unbounded => return Ok(0),
            Bound::Included(v) => list.binary_search_by(|e| {
                let cell = self.table.get_cell(RowId::new(e), self.column)?;
                Ok(if cell < *v { Ordering::Less } else { Ordering::Greater })
            })?,
            Bound::Excluded(v) => list.binary_search_by(|e| {
                let cell = self.table.get_cell(RowId::new(e), self.column)?;
                Ok(if cell <= *v { Ordering::Less } else { Ordering::Greater })
            })?,
        };
        Ok(position.unwrap_or_else(|p| p))
    }

    /// First position whose cell is past `bound`.
    fn upper_position(&self, list: &IndexIntegerList, bound: Bound<&Value>) -> CoreResult<usize> {
        match bound {
            Bound::Unbounded => Ok(list.len()),
            Bound::Included(v) => self.lower_position(list, Bound::Excluded(v)),
            Bound::Excluded(v) => self.lower_position(list, Bound::Included(v)),
        }
    }

    /// Rows whose cell lies within the bounds, in index order.
    pub(crate) fn select_range(
        &self,
        list: &IndexIntegerList,
        lower: Bound<&Value>,
        upper: Bound<&Value>,
    ) -> CoreResult<Vec<RowId>> {
        let start = self.lower_position(list, lower)?;
        let end = self.upper_position(list, upper)?;
        Ok((start..end.max(start))
            .filter_map(|pos| list.get(pos))
            .map(RowId::new)
            .collect())
    }

    /// Rows whose cell equals `value`, in row order.
    pub(crate) fn select_equal(&self, list: &IndexIntegerList, value: &Value) -> CoreResult<Vec<RowId>> {
        self.select_range(list, Bound::Included(value), Bound::Included(value))
    }
}

fn within(cell: &Value, lower: Bound<&Value>, upper: Bound<&Value>) -> bool {
    let above = match lower {
        Bound::Included(v) => cell >= v,
        Bound::Excluded(v) => cell > v,
        Bound::Unbounded => true,
    };
    let below = match upper {
        Bound::Included(v) => cell <= v,
        Bound::Excluded(v) => cell < v,
        Bound::Unbounded => true,
    };
    above && below
}

/// Rows of `rows` whose cell lies within the bounds, ordered like an index.
pub(crate) fn scan_range(
    table: &MasterTable,
    column: usize,
    rows: impl IntoIterator<Item = RowId>,
    lower: Bound<&Value>,
    upper: Bound<&Value>,
) -> CoreResult<Vec<RowId>> {
    let mut matched = Vec::new();
    for row in rows {
        let cell = table.get_cell(row, column)?;
        if within(&cell, lower, upper) {
            matched.push((cell, row));
        }
    }
    matched.sort();
    Ok(matched.into_iter().map(|(_, row)| row).collect())
}

/// Applies one journal entry to the row list.
pub(crate) fn apply_to_row_list(list: &mut IndexIntegerList, entry: &JournalEntry) {
    if entry.command.is_add() {
        list.insert_sort(entry.row.as_u32());
    } else {
        list.remove_sort(entry.row.as_u32());
    }
}

/// Applies one journal entry to the scheme of `column`.
pub(crate) fn apply_to_scheme(
    table: &MasterTable,
    column: usize,
    list: &mut IndexIntegerList,
    entry: &JournalEntry,
) -> CoreResult<()> {
    let scheme = ColumnScheme::new(table, column);
    if entry.command.is_add() {
        scheme.insert(list, entry.row)
    } else {
        scheme.remove(list, entry.row)
    }
}

/// Undoes one journal entry on the scheme of `column`.
pub(crate) fn revert_on_scheme(
    table: &MasterTable,
    column: usize,
    list: &mut IndexIntegerList,
    entry: &JournalEntry,
) -> CoreResult<()> {
    let scheme = ColumnScheme::new(table, column);
    if entry.command.is_add() {
        scheme.remove(list, entry.row)
    } else {
        scheme.insert(list, entry.row)
    }
}

/// Replays `entries` onto every list of `set`.
pub(crate) fn apply_entries(
    table: &MasterTable,
    set: &mut IndexSet,
    entries: &[JournalEntry],
) -> CoreResult<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let list = set.get_index(ROW_LIST)?;
    for entry in entries {
        apply_to_row_list(list, entry);
    }
    for (column, index) in table.schema().indexed_columns() {
        let list = set.get_index(index)?;
        for entry in entries {
            apply_to_scheme(table, column, list, entry)?;
        }
    }
    Ok(())
}

/// Rows of the row list in `set` matching `value` on `column`.
pub(crate) fn select_equal_in(
    table: &MasterTable,
    set: &mut IndexSet,
    column: usize,
    value: &Value,
) -> CoreResult<Vec<RowId>> {
    match table.schema().index_number(column) {
        Some(index) => ColumnScheme::new(table, column).select_equal(set.get_index(index)?, value),
        None => {
            let rows: Vec<RowId> = set.get_index(ROW_LIST)?.iter().map(RowId::new).collect();
            scan_range(
                table,
                column,
                rows,
                Bound::Included(value),
                Bound::Included(value),
            )
        }
    }
}

/// Rows whose cells on `columns` equal `values`.
pub(crate) fn rows_matching_in(
    table: &MasterTable,
    set: &mut IndexSet,
    columns: &[usize],
    values: &[Value],
) -> CoreResult<Vec<RowId>> {
    let (Some((&first, rest)), Some((value, rest_values))) =
        (columns.split_first(), values.split_first())
    else {
        return Ok(set.get_index(ROW_LIST)?.iter().map(RowId::new).collect());
    };
    let candidates = select_equal_in(table, set, first, value)?;
    let mut matched = Vec::with_capacity(candidates.len());
    'rows: for row in candidates {
        for (column, value) in rest.iter().zip(rest_values) {
            if table.get_cell(row, *column)? != *value {
                continue 'rows;
            }
        }
        matched.push(row);
    }
    Ok(matched)
}

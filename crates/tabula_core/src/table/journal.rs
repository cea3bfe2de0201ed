//! Per-transaction change log of one table.

use crate::error::{CoreError, CoreResult};
use crate::types::{CommitId, RowId, TableId};
use std::collections::BTreeSet;

/// Kind of change a journal entry records.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalCommand {
    /// A row was inserted.
    AddRow = 1,
    /// A row was deleted.
    RemoveRow = 2,
    /// The new version of an updated row.
    UpdateAddRow = 5,
    /// The old version of an updated row.
    UpdateRemoveRow = 6,
}

impl JournalCommand {
    /// Stable numeric code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether the command adds a row to the table.
    #[must_use]
    pub const fn is_add(self) -> bool {
        matches!(self, Self::AddRow | Self::UpdateAddRow)
    }

    /// Whether the command removes a row from the table.
    #[must_use]
    pub const fn is_remove(self) -> bool {
        matches!(self, Self::RemoveRow | Self::UpdateRemoveRow)
    }
}

impl TryFrom<u8> for JournalCommand {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::AddRow),
            2 => Ok(Self::RemoveRow),
            5 => Ok(Self::UpdateAddRow),
            6 => Ok(Self::UpdateRemoveRow),
            _ => Err(CoreError::InvalidFormat {
                message: format!("unknown journal command: {value}"),
            }),
        }
    }
}

/// One journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    /// What happened.
    pub command: JournalCommand,
    /// The row it happened to.
    pub row: RowId,
}

/// Ordered, append-only log of row changes a transaction made to a table.
///
/// Once committed the journal gets a commit id and becomes part of the
/// table's history, which later commits consult to detect clashes.
#[derive(Debug, Clone)]
pub struct MasterTableJournal {
    table_id: TableId,
    commit_id: Option<CommitId>,
    entries: Vec<JournalEntry>,
}

impl MasterTableJournal {
    /// Creates an empty journal for `table_id`.
    #[must_use]
    pub fn new(table_id: TableId) -> Self {
        Self {
            table_id,
            commit_id: None,
            entries: Vec::new(),
        }
    }

    /// The table this journal belongs to.
    #[must_use]
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Commit id, set once the journal is committed.
    #[must_use]
    pub fn commit_id(&self) -> Option<CommitId> {
        self.commit_id
    }

    pub(crate) fn set_commit_id(&mut self, commit_id: CommitId) {
        self.commit_id = Some(commit_id);
    }

    /// Appends an entry.
    pub fn add_entry(&mut self, command: JournalCommand, row: RowId) {
        self.entries.push(JournalEntry { command, row });
    }

    /// Entries in append order.
    #[must_use]
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the journal is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every row named by a removing entry.
    pub fn removed_rows(&self) -> impl Iterator<Item = RowId> + '_ {
        self.entries
            .iter()
            .filter(|e| e.command.is_remove())
            .map(|e| e.row)
    }

    /// Every row named by an adding entry.
    pub fn added_rows(&self) -> impl Iterator<Item = RowId> + '_ {
        self.entries
            .iter()
            .filter(|e| e.command.is_add())
            .map(|e| e.row)
    }

    /// Rows this journal adds that it does not also remove, sorted.
    #[must_use]
    pub fn normalized_added_rows(&self) -> Vec<RowId> {
        let removed: BTreeSet<RowId> = self.removed_rows().collect();
        let added: BTreeSet<RowId> = self.added_rows().filter(|r| !removed.contains(r)).collect();
        added.into_iter().collect()
    }

    /// Rows this journal removes that existed before it, sorted.
    #[must_use]
    pub fn normalized_removed_rows(&self) -> Vec<RowId> {
        let added: BTreeSet<RowId> = self.added_rows().collect();
        let removed: BTreeSet<RowId> =
            self.removed_rows().filter(|r| !added.contains(r)).collect();
        removed.into_iter().collect()
    }

    /// Checks this journal against one committed concurrently on the same
    /// table. Returns the first row both journals remove.
    ///
    /// Updates remove the old row version, so an update clashes with a
    /// concurrent delete or update of the same row.
    #[must_use]
    pub fn test_commit_clash(&self, other: &MasterTableJournal) -> Option<RowId> {
        let theirs: BTreeSet<RowId> = other.removed_rows().collect();
        self.removed_rows().find(|r| theirs.contains(r))
    }

    /// Removes the last `n` entries and returns them in append order.
    pub fn rollback_entries(&mut self, n: usize) -> Vec<JournalEntry> {
        let keep = self.entries.len().saturating_sub(n);
        self.entries.split_off(keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal(entries: &[(JournalCommand, u32)]) -> MasterTableJournal {
        let mut j = MasterTableJournal::new(TableId::new(1));
        for (cmd, row) in entries {
            j.add_entry(*cmd, RowId::new(*row));
        }
        j
    }

    #[test]
    fn command_codes() {
        assert_eq!(JournalCommand::AddRow.code(), 1);
        assert_eq!(JournalCommand::RemoveRow.code(), 2);
        assert_eq!(JournalCommand::UpdateAddRow.code(), 5);
        assert_eq!(JournalCommand::UpdateRemoveRow.code(), 6);
        assert_eq!(JournalCommand::try_from(6).unwrap(), JournalCommand::UpdateRemoveRow);
        assert!(JournalCommand::try_from(3).is_err());
    }

    #[test]
    fn normalized_rows_cancel_out() {
        use JournalCommand::*;
        let j = journal(&[(AddRow, 10), (RemoveRow, 3), (AddRow, 11), (RemoveRow, 10)]);
        assert_eq!(j.normalized_added_rows(), vec![RowId::new(11)]);
        assert_eq!(j.normalized_removed_rows(), vec![RowId::new(3)]);
    }

    #[test]
    fn clash_on_shared_removal() {
        use JournalCommand::*;
        let mine = journal(&[(UpdateRemoveRow, 4), (UpdateAddRow, 9)]);
        let theirs = journal(&[(RemoveRow, 4)]);
        let unrelated = journal(&[(RemoveRow, 5), (AddRow, 4)]);

        assert_eq!(mine.test_commit_clash(&theirs), Some(RowId::new(4)));
        assert_eq!(mine.test_commit_clash(&unrelated), None);
    }

    #[test]
    fn rollback_truncates_tail() {
        use JournalCommand::*;
        let mut j = journal(&[(AddRow, 1), (AddRow, 2), (RemoveRow, 1)]);
        let undone = j.rollback_entries(2);
        assert_eq!(undone.len(), 2);
        assert_eq!(undone[0].row, RowId::new(2));
        assert_eq!(j.len(), 1);
        assert!(j.rollback_entries(5).len() == 1 && j.is_empty());
    }
}

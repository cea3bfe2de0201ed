//! Names of schema objects created or dropped by committed transactions.

use crate::types::CommitId;
use std::collections::BTreeSet;
use std::fmt;

/// A schema object name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectName {
    /// A table.
    Table(String),
    /// A constraint.
    Constraint(String),
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(name) => write!(f, "table {name}"),
            Self::Constraint(name) => write!(f, "constraint {name}"),
        }
    }
}

/// Names one commit created or dropped.
#[derive(Debug, Clone)]
pub struct NamespaceJournal {
    /// The commit.
    pub commit_id: CommitId,
    /// Names it touched.
    pub names: BTreeSet<ObjectName>,
}

/// Rolling history of [`NamespaceJournal`]s, kept while an open
/// transaction's snapshot predates them.
#[derive(Debug, Default)]
pub struct NamespaceHistory {
    entries: Vec<NamespaceJournal>,
}

impl NamespaceHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the names `commit_id` touched.
    pub fn record(&mut self, commit_id: CommitId, names: BTreeSet<ObjectName>) {
        if !names.is_empty() {
            self.entries.push(NamespaceJournal { commit_id, names });
        }
    }

    /// First of `names` touched by a commit after `snapshot`.
    #[must_use]
    pub fn test_clash(&self, snapshot: CommitId, names: &BTreeSet<ObjectName>) -> Option<ObjectName> {
        self.entries
            .iter()
            .filter(|j| j.commit_id > snapshot)
            .find_map(|j| j.names.intersection(names).next().cloned())
    }

    /// Forgets entries no open snapshot predates.
    pub fn trim(&mut self, min_snapshot: CommitId) {
        self.entries.retain(|j| j.commit_id > min_snapshot);
    }

    /// Number of journals kept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[ObjectName]) -> BTreeSet<ObjectName> {
        list.iter().cloned().collect()
    }

    #[test]
    fn clash_only_after_snapshot() {
        let mut history = NamespaceHistory::new();
        history.record(CommitId::new(2), names(&[ObjectName::Table("t".into())]));
        history.record(CommitId::new(5), names(&[ObjectName::Constraint("t".into())]));

        let mine = names(&[ObjectName::Table("t".into())]);
        assert_eq!(
            history.test_clash(CommitId::new(1), &mine),
            Some(ObjectName::Table("t".into()))
        );
        assert_eq!(history.test_clash(CommitId::new(2), &mine), None);
    }

    #[test]
    fn trim_drops_old_entries() {
        let mut history = NamespaceHistory::new();
        history.record(CommitId::new(1), names(&[ObjectName::Table("a".into())]));
        history.record(CommitId::new(2), BTreeSet::new());
        history.record(CommitId::new(3), names(&[ObjectName::Table("b".into())]));
        assert_eq!(history.len(), 2);

        history.trim(CommitId::new(1));
        assert_eq!(history.len(), 1);
        history.trim(CommitId::new(3));
        assert!(history.is_empty());
    }
}

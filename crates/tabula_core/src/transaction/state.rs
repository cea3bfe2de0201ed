//! Transaction state.

use std::fmt;

/// State of a transaction.
///
/// ```text
/// Active ──commit──▶ Committing ──▶ Committed
///   │                    ├────────▶ Aborted
///   │                    └────────▶ Failed
///   └──rollback──▶ RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Commit checks are running.
    Committing,
    /// Transaction has been committed.
    Committed,
    /// A commit check failed; the changes were discarded.
    Aborted,
    /// Transaction was rolled back by the caller.
    RolledBack,
    /// Storage failed while the commit was being applied; the database
    /// was closed.
    Failed,
}

impl TransactionState {
    /// Whether the transaction has ended.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted | Self::RolledBack | Self::Failed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::RolledBack => "rolled back",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

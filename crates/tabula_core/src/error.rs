//! Error types for Tabula core.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// The check that detected a serialization conflict at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// A table this transaction read from was changed by a concurrent commit.
    DirtySelect,
    /// A schema object name was created or dropped concurrently.
    NamespaceClash,
    /// A concurrent commit removed a row this transaction also removes.
    RowClash,
    /// A table this transaction modified was dropped concurrently.
    TableDropped,
    /// A table this transaction drops was modified concurrently.
    DroppedTableModified,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DirtySelect => "dirty select",
            Self::NamespaceClash => "namespace clash",
            Self::RowClash => "row clash",
            Self::TableDropped => "table dropped",
            Self::DroppedTableModified => "dropped table modified",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in Tabula core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Area store error.
    #[error("storage error: {0}")]
    Storage(#[from] tabula_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A cell or schema could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Invalid on-disk format or version.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Persisted structures are inconsistent.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Serialization failure detected while committing.
    #[error("transaction conflict ({kind}) on {scope}: {message}", scope = .table.as_deref().unwrap_or("<namespace>"))]
    TransactionConflict {
        /// Which check detected the conflict.
        kind: ConflictKind,
        /// The table involved, if any.
        table: Option<String>,
        /// Description of the clash.
        message: String,
    },

    /// A constraint was violated.
    #[error("constraint violation: {constraint} on table {table}: {message}")]
    ConstraintViolation {
        /// Name of the violated constraint.
        constraint: String,
        /// The table the constraint belongs to.
        table: String,
        /// Description of the violation.
        message: String,
    },

    /// Table not found.
    #[error("table not found: {name}")]
    TableNotFound {
        /// Name of the table.
        name: String,
    },

    /// Table already exists.
    #[error("table already exists: {name}")]
    TableExists {
        /// Name of the table.
        name: String,
    },

    /// Row not visible in the table.
    #[error("row {row} not found in table {table}")]
    RowNotFound {
        /// The table searched.
        table: String,
        /// The row id.
        row: u32,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a transaction conflict error.
    pub fn conflict(
        kind: ConflictKind,
        table: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::TransactionConflict {
            kind,
            table: table.map(str::to_owned),
            message: message.into(),
        }
    }

    /// Creates a constraint violation error.
    pub fn constraint_violation(
        constraint: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ConstraintViolation {
            constraint: constraint.into(),
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates a table not found error.
    pub fn table_not_found(name: impl Into<String>) -> Self {
        Self::TableNotFound { name: name.into() }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Whether this is a serialization conflict the caller may retry.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::TransactionConflict { .. })
    }

    /// Returns the conflict kind for conflict errors.
    #[must_use]
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            Self::TransactionConflict { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether this is a constraint violation.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }
}

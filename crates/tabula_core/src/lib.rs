//! # Tabula Core
//!
//! Transactional table engine for Tabula.
//!
//! This crate provides:
//! - Master tables: slot lists of immutable row records with persisted
//!   status bits and a free chain
//! - Copy-on-write index sets shared between transaction snapshots
//! - Snapshot-isolated transactions with per-table journals
//! - The commit coordinator: conflict checks, deferred constraints and
//!   commit listeners
//! - Garbage collection of removed rows and dropped tables
//!
//! ## Example
//!
//! ```rust
//! use tabula_core::{ColumnDef, ColumnType, Database, TableSchema, Value};
//!
//! let db = Database::open_in_memory().unwrap();
//! db.transaction(|txn| {
//!     txn.create_table(
//!         TableSchema::new("users")
//!             .column(ColumnDef::new("id", ColumnType::Integer).not_null().indexed())
//!             .column(ColumnDef::new("name", ColumnType::Text)),
//!     )?;
//!     txn.insert("users", &[Value::Integer(1), Value::Text("Alice".into())])?;
//!     Ok(())
//! })
//! .unwrap();
//!
//! let mut txn = db.begin().unwrap();
//! let users = txn.table("users").unwrap();
//! assert_eq!(users.select_equal(0, &Value::Integer(1)).unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod blob;
mod config;
mod database;
mod error;
pub mod index;
mod registry;
mod schema;
mod stats;
pub mod table;
pub mod transaction;
mod types;
mod value;

pub use blob::{BlobStore, InMemoryBlobStore};
pub use config::Config;
pub use database::Database;
pub use error::{ConflictKind, CoreError, CoreResult};
pub use schema::{ColumnDef, TableSchema};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use table::{MasterTable, RowStatus, SlotSummary, TableReport, TableView};
pub use transaction::{
    CheckExpression, CommitModificationEvent, Constraint, ConstraintKind, Deferrability,
    ObjectName, RowResolver, Transaction, TransactionState,
};
pub use types::{CommitId, RowId, TableId, TransactionId};
pub use value::{BlobRef, ColumnType, Value};

//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use std::path::PathBuf;
use std::sync::Once;
use tabula_core::{ColumnDef, ColumnType, Config, Database, RowId, TableSchema, Value};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Name of the table created by [`items_schema`].
pub const ITEMS: &str = "items";

static TRACING: Once = Once::new();

/// Installs a `tracing` subscriber for tests, once per process.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        init_tracing();
        Self {
            db: Database::open_in_memory().expect("Failed to open in-memory database"),
            temp_dir: None,
        }
    }

    /// Creates a new file-based test database.
    pub fn file() -> Self {
        Self::file_with_config(Config::default())
    }

    /// Creates a new file-based test database with custom configuration.
    pub fn file_with_config(config: Config) -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("test.tabula");
        let db = Database::open_with_config(&path, config).expect("Failed to open file database");
        Self {
            db,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("test.tabula"))
    }

    /// Closes and reopens a file-based database in place.
    ///
    /// # Panics
    ///
    /// Panics for in-memory databases, which cannot be reopened.
    pub fn reopen(self) -> Self {
        let Self { db, temp_dir } = self;
        let temp_dir = temp_dir.expect("in-memory databases cannot be reopened");
        db.close().expect("Failed to close database");
        drop(db);
        let path = temp_dir.path().join("test.tabula");
        Self {
            db: Database::open(&path).expect("Failed to reopen database"),
            temp_dir: Some(temp_dir),
        }
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Schema of the `items` table: an indexed, non-null integer `id` and a
/// text `name`.
pub fn items_schema() -> TableSchema {
    TableSchema::new(ITEMS)
        .column(ColumnDef::new("id", ColumnType::Integer).not_null().indexed())
        .column(ColumnDef::new("name", ColumnType::Text))
}

/// An `items` row.
pub fn item(id: i64, name: &str) -> Vec<Value> {
    vec![Value::Integer(id), Value::Text(name.to_owned())]
}

/// Creates the `items` table in its own transaction.
pub fn create_items(db: &Database) {
    db.transaction(|txn| txn.create_table(items_schema()))
        .expect("Failed to create items table");
}

/// Inserts `count` items with ids `0..count` in one transaction.
pub fn populate_items(db: &Database, count: i64) -> Vec<RowId> {
    db.transaction(|txn| {
        (0..count)
            .map(|id| txn.insert(ITEMS, &item(id, &format!("item-{id}"))))
            .collect()
    })
    .expect("Failed to populate items")
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use tabula_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         let txn = db.begin().unwrap();
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary in-memory database holding an empty
/// `items` table.
pub fn with_items_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    with_temp_db(|db| {
        create_items(db);
        f(db)
    })
}

/// Runs a test with a temporary file-based database.
pub fn with_temp_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::file();
    f(&test_db.db)
}

/// Number of `table` rows visible to a fresh transaction.
pub fn visible_rows(db: &Database, table: &str) -> usize {
    let mut txn = db.begin().expect("Failed to begin transaction");
    txn.table(table)
        .and_then(|view| view.row_count())
        .expect("Failed to count rows")
}

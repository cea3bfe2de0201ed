//! Main database interface.

use crate::blob::{BlobStore, InMemoryBlobStore};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::registry::Registry;
use crate::stats::{DatabaseStats, StatsSnapshot};
use crate::table::{MasterTable, TableEnv, TableReport, TableView};
use crate::transaction::{
    CommitListeners, CommitModificationEvent, ConstraintRegistry, NamespaceHistory, Transaction,
    TransactionManager,
};
use crate::types::{CommitId, TableId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tabula_storage::{AreaStore, FileAreaStore, HeapAreaStore};

/// Tables by visibility.
#[derive(Default)]
pub(crate) struct Catalog {
    /// Tables new transactions see.
    pub(crate) visible: BTreeMap<String, Arc<MasterTable>>,
    /// Dropped tables and the commit that dropped them, kept until no
    /// snapshot can still see them.
    pub(crate) dropped: Vec<(Arc<MasterTable>, CommitId)>,
}

/// State shared by a database handle and its transactions.
pub(crate) struct Conglomerate {
    pub(crate) config: Config,
    pub(crate) env: TableEnv,
    pub(crate) manager: TransactionManager,
    pub(crate) catalog: RwLock<Catalog>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) namespace: Mutex<NamespaceHistory>,
    pub(crate) constraints: RwLock<ConstraintRegistry>,
    pub(crate) listeners: CommitListeners,
    is_open: RwLock<bool>,
}

impl Conglomerate {
    /// Starts a transaction seeing the latest commit.
    fn begin(self: &Arc<Self>) -> CoreResult<Transaction> {
        let _guard = self.manager.commit_lock();
        let (id, snapshot) = self.manager.begin();
        let mut views = BTreeMap::new();
        {
            let catalog = self.catalog.read();
            for (name, table) in &catalog.visible {
                match table.create_index_set() {
                    Ok(set) => {
                        views.insert(name.clone(), TableView::new(Arc::clone(table), set));
                    }
                    Err(err) => {
                        self.manager.finish(id);
                        return Err(err);
                    }
                }
            }
        }
        let constraints = self.constraints.read().clone();
        self.env.stats.record_transaction_start();
        tracing::trace!(txn = %id, %snapshot, "began transaction");
        Ok(Transaction::new(Arc::clone(self), id, snapshot, views, constraints))
    }

    /// Releases what no open snapshot can see any more: journals, removed
    /// rows, namespace history and the storage of dropped tables. Returns
    /// the number of rows reclaimed.
    ///
    /// Callers hold the commit lock.
    pub(crate) fn maintain(&self) -> usize {
        let min = self.manager.min_snapshot();
        let tables: Vec<Arc<MasterTable>> = self.catalog.read().visible.values().cloned().collect();
        let mut reclaimed = 0;
        for table in &tables {
            table.merge_journal_changes(min);
            if table.pending_reclaim() == 0 {
                continue;
            }
            match table.collect_garbage(min) {
                Ok(n) => reclaimed += n,
                Err(err) => {
                    tracing::warn!(table = %table.name(), error = %err, "garbage collection failed");
                }
            }
        }
        self.namespace.lock().trim(min);

        let expired: Vec<Arc<MasterTable>> = {
            let mut catalog = self.catalog.write();
            let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut catalog.dropped)
                .into_iter()
                .partition(|(_, dropped_at)| *dropped_at <= min);
            catalog.dropped = kept;
            expired.into_iter().map(|(table, _)| table).collect()
        };
        if !expired.is_empty() {
            let mut ids: Vec<TableId> = Vec::with_capacity(expired.len());
            for table in expired {
                if let Err(err) = table.drop_storage() {
                    tracing::warn!(table = %table.name(), error = %err, "failed to release dropped table");
                }
                ids.push(table.id());
            }
            if let Err(err) = self.registry.lock().forget_deleted(&ids) {
                tracing::warn!(error = %err, "failed to forget dropped tables");
            }
        }
        reclaimed
    }

    pub(crate) fn checkpoint(&self) -> CoreResult<()> {
        self.env.store.checkpoint()?;
        self.env.stats.record_checkpoint();
        Ok(())
    }

    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    /// Closes the database without a checkpoint after a commit failed
    /// part way through.
    ///
    /// Callers hold the commit lock.
    pub(crate) fn close_after_failure(&self) {
        *self.is_open.write() = false;
        tracing::error!("closed database after a failed commit");
    }
}

/// The main database handle.
///
/// `Database` is the entry point for all Tabula operations. It manages:
/// - The table registry and master tables
/// - Transaction snapshots and the commit coordinator
/// - Garbage collection of removed rows and dropped tables
///
/// # Example
///
/// ```rust,ignore
/// use tabula_core::{ColumnDef, ColumnType, Database, TableSchema, Value};
///
/// let db = Database::open_in_memory()?;
/// db.transaction(|txn| {
///     txn.create_table(
///         TableSchema::new("users").column(ColumnDef::new("name", ColumnType::Text)),
///     )?;
///     txn.insert("users", &[Value::Text("Alice".into())])?;
///     Ok(())
/// })?;
/// ```
pub struct Database {
    inner: Arc<Conglomerate>,
}

impl Database {
    /// Opens a database stored in the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a database stored in the file at `path` with custom
    /// configuration.
    ///
    /// Large objects are held by an in-memory blob store; use
    /// [`Database::open_with_store`] to supply a persistent one.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, is missing and
    /// `create_if_missing` is off, or exists and `error_if_exists` is on.
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        let exists = path.exists();
        if !exists && !config.create_if_missing {
            return Err(CoreError::invalid_operation(format!(
                "database {} does not exist",
                path.display()
            )));
        }
        if exists && config.error_if_exists {
            return Err(CoreError::invalid_operation(format!(
                "database {} already exists",
                path.display()
            )));
        }
        let store = Arc::new(FileAreaStore::open(path)?);
        Self::open_with_store(config, store, Arc::new(InMemoryBlobStore::new()))
    }

    /// Opens a fresh in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_with_store(
            Config::default(),
            Arc::new(HeapAreaStore::new()),
            Arc::new(InMemoryBlobStore::new()),
        )
    }

    /// Opens a database over the given stores.
    ///
    /// An empty store gets a new table registry. Otherwise every table is
    /// loaded and recovered: rows left uncommitted are abandoned, removed
    /// rows are reclaimed and the storage of dropped tables is released.
    ///
    /// # Errors
    ///
    /// Returns an error if the store holds something other than a Tabula
    /// database or its structures are damaged.
    pub fn open_with_store(
        config: Config,
        store: Arc<dyn AreaStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> CoreResult<Self> {
        let stats = Arc::new(DatabaseStats::new());
        let env = TableEnv {
            store: Arc::clone(&store),
            blobs,
            stats,
            index_block_size: config.index_block_size,
            cell_cache_capacity: config.cell_cache_capacity,
        };

        let mut registry = match store.root_area() {
            Some(root) => Registry::open(Arc::clone(&store), root)?,
            None => Registry::create(Arc::clone(&store))?,
        };

        let mut catalog = Catalog::default();
        let mut recovered = 0;
        for entry in registry.visible() {
            let table = MasterTable::open(&env, entry.header)?;
            recovered += table.recover()?;
            catalog.visible.insert(table.name().to_owned(), table);
        }

        let stale: Vec<TableId> = registry.deleted().iter().map(|e| e.id).collect();
        for entry in registry.deleted() {
            let released = MasterTable::open(&env, entry.header).and_then(|t| t.drop_storage());
            if let Err(err) = released {
                tracing::warn!(table = %entry.id, error = %err, "failed to release dropped table");
            }
        }
        registry.forget_deleted(&stale)?;

        let last_commit = registry.last_commit();
        tracing::info!(
            tables = catalog.visible.len(),
            %last_commit,
            recovered,
            "opened database"
        );

        let inner = Conglomerate {
            manager: TransactionManager::new(last_commit),
            config,
            env,
            catalog: RwLock::new(catalog),
            registry: Mutex::new(registry),
            namespace: Mutex::new(NamespaceHistory::new()),
            constraints: RwLock::new(ConstraintRegistry::new()),
            listeners: CommitListeners::new(),
            is_open: RwLock::new(true),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Begins a new transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed.
    pub fn begin(&self) -> CoreResult<Transaction> {
        self.ensure_open()?;
        self.inner.begin()
    }

    /// Commits a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction belongs to another database or
    /// any commit check fails.
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<CommitId> {
        self.ensure_open()?;
        if !txn.belongs_to(&self.inner) {
            return Err(CoreError::invalid_operation(
                "transaction belongs to another database",
            ));
        }
        txn.commit()
    }

    /// Rolls back a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active.
    pub fn rollback(&self, txn: &mut Transaction) -> CoreResult<()> {
        txn.rollback()
    }

    /// Executes a function within a transaction.
    ///
    /// The transaction is committed if the function returns `Ok`,
    /// or rolled back if it returns `Err`.
    ///
    /// # Errors
    ///
    /// Returns the function's error, or the commit error.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction) -> CoreResult<T>,
    {
        let mut txn = self.begin()?;
        match f(&mut txn) {
            Ok(result) => {
                self.commit(&mut txn)?;
                Ok(result)
            }
            Err(err) => {
                let _ = txn.rollback();
                Err(err)
            }
        }
    }

    /// Writes a durable image of the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.ensure_open()?;
        let _guard = self.inner.manager.commit_lock();
        self.inner.checkpoint()
    }

    /// Reclaims every removed row and dropped table no open transaction
    /// can see. Returns the number of rows reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed.
    pub fn collect_garbage(&self) -> CoreResult<usize> {
        self.ensure_open()?;
        let _guard = self.inner.manager.commit_lock();
        Ok(self.inner.maintain())
    }

    /// Checks every table's slots and indexes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` while transactions are open, or an error
    /// if storage cannot be read.
    pub fn verify(&self) -> CoreResult<Vec<TableReport>> {
        self.ensure_open()?;
        let _guard = self.inner.manager.commit_lock();
        let open = self.inner.manager.open_count();
        if open > 0 {
            return Err(CoreError::invalid_operation(format!(
                "cannot verify with {open} open transactions"
            )));
        }
        let tables: Vec<Arc<MasterTable>> =
            self.inner.catalog.read().visible.values().cloned().collect();
        tables.iter().map(|t| t.verify()).collect()
    }

    /// Rebuilds every table's free chain and indexes from its committed
    /// rows.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` while transactions are open, or an error
    /// if storage fails.
    pub fn repair(&self) -> CoreResult<Vec<TableReport>> {
        self.ensure_open()?;
        let _guard = self.inner.manager.commit_lock();
        let open = self.inner.manager.open_count();
        if open > 0 {
            return Err(CoreError::invalid_operation(format!(
                "cannot repair with {open} open transactions"
            )));
        }
        let tables: Vec<Arc<MasterTable>> =
            self.inner.catalog.read().visible.values().cloned().collect();
        let reports = tables
            .iter()
            .map(|t| t.repair())
            .collect::<CoreResult<Vec<_>>>()?;
        tracing::info!(tables = reports.len(), "repaired tables");
        Ok(reports)
    }

    /// Registers a handler run before every commit that changes `table`.
    /// An error from the handler aborts the commit.
    pub fn on_before_commit<F>(&self, table: impl Into<String>, handler: F)
    where
        F: Fn(&CommitModificationEvent) -> CoreResult<()> + Send + Sync + 'static,
    {
        self.inner.listeners.on_before_commit(table, handler);
    }

    /// Subscribes to the changes of every successful commit.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<CommitModificationEvent> {
        self.inner.listeners.subscribe()
    }

    /// Returns a snapshot of the database counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.env.stats.snapshot()
    }

    /// Names of the committed tables.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        self.inner.catalog.read().visible.keys().cloned().collect()
    }

    /// The committed master table called `name`.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if there is no such table.
    pub fn master_table(&self, name: &str) -> CoreResult<Arc<MasterTable>> {
        self.inner
            .catalog
            .read()
            .visible
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::table_not_found(name))
    }

    /// The last published commit.
    #[must_use]
    pub fn last_commit(&self) -> CommitId {
        self.inner.manager.last_commit()
    }

    /// Closes the database, writing a final checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint fails.
    pub fn close(&self) -> CoreResult<()> {
        let _guard = self.inner.manager.commit_lock();
        let mut is_open = self.inner.is_open.write();
        if !*is_open {
            return Ok(());
        }
        self.inner.checkpoint()?;
        *is_open = false;
        tracing::info!("closed database");
        Ok(())
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.inner.is_open.read()
    }

    /// Ensures the database is open.
    fn ensure_open(&self) -> CoreResult<()> {
        self.inner.ensure_open()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("last_commit", &self.last_commit())
            .field("tables", &self.inner.catalog.read().visible.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConflictKind;
    use crate::schema::{ColumnDef, TableSchema};
    use crate::table::RowStatus;
    use crate::transaction::{Constraint, TransactionState};
    use crate::value::{ColumnType, Value};
    use crate::types::RowId;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tabula_storage::{AreaId, StorageError, StorageResult, WriteLock};

    /// A heap store that can record the areas it creates and fail writes
    /// to chosen areas.
    #[derive(Default)]
    struct FaultyStore {
        inner: HeapAreaStore,
        recording: Mutex<Option<Vec<AreaId>>>,
        failing: Mutex<HashSet<AreaId>>,
    }

    impl FaultyStore {
        fn start_recording(&self) {
            *self.recording.lock() = Some(Vec::new());
        }

        fn stop_recording(&self) -> Vec<AreaId> {
            self.recording.lock().take().unwrap_or_default()
        }

        fn fail_writes_to(&self, areas: &[AreaId]) {
            self.failing.lock().extend(areas.iter().copied());
        }
    }

    impl AreaStore for FaultyStore {
        fn create_area(&self, size: usize) -> StorageResult<AreaId> {
            let id = self.inner.create_area(size)?;
            if let Some(created) = self.recording.lock().as_mut() {
                created.push(id);
            }
            Ok(id)
        }

        fn area_size(&self, id: AreaId) -> StorageResult<usize> {
            self.inner.area_size(id)
        }

        fn read_at(&self, id: AreaId, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
            self.inner.read_at(id, offset, len)
        }

        fn read_area(&self, id: AreaId) -> StorageResult<bytes::Bytes> {
            self.inner.read_area(id)
        }

        fn write_at(&self, id: AreaId, offset: usize, data: &[u8]) -> StorageResult<()> {
            if self.failing.lock().contains(&id) {
                return Err(StorageError::Io(std::io::Error::other("injected write failure")));
            }
            self.inner.write_at(id, offset, data)
        }

        fn delete_area(&self, id: AreaId) -> StorageResult<()> {
            self.inner.delete_area(id)
        }

        fn lock_for_write(&self) -> WriteLock<'_> {
            self.inner.lock_for_write()
        }

        fn checkpoint(&self) -> StorageResult<()> {
            self.inner.checkpoint()
        }

        fn root_area(&self) -> Option<AreaId> {
            self.inner.root_area()
        }

        fn set_root_area(&self, id: Option<AreaId>) -> StorageResult<()> {
            self.inner.set_root_area(id)
        }
    }

    fn create_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn items_schema() -> TableSchema {
        TableSchema::new("items")
            .column(ColumnDef::new("id", ColumnType::Integer).not_null().indexed())
            .column(ColumnDef::new("name", ColumnType::Text))
    }

    fn item(id: i64, name: &str) -> Vec<Value> {
        vec![Value::Integer(id), Value::Text(name.into())]
    }

    fn create_items(db: &Database) {
        db.transaction(|txn| txn.create_table(items_schema())).unwrap();
    }

    fn insert_item(db: &Database, id: i64) -> RowId {
        db.transaction(|txn| txn.insert("items", &item(id, "x"))).unwrap()
    }

    #[test]
    fn open_in_memory() {
        let db = create_db();
        assert!(db.is_open());
        assert!(db.table_names().is_empty());
        assert_eq!(db.last_commit(), CommitId::ZERO);
    }

    #[test]
    fn closed_database_rejects_transactions() {
        let db = create_db();
        db.close().unwrap();
        assert!(matches!(db.begin(), Err(CoreError::DatabaseClosed)));
    }

    #[test]
    fn create_table_visible_after_commit() {
        let db = create_db();
        let mut outsider = db.begin().unwrap();
        create_items(&db);
        assert_eq!(db.table_names(), vec!["items".to_string()]);
        assert!(matches!(
            outsider.table("items"),
            Err(CoreError::TableNotFound { .. })
        ));
        let mut later = db.begin().unwrap();
        assert_eq!(later.table("items").unwrap().row_count().unwrap(), 0);
    }

    #[test]
    fn snapshot_isolation() {
        let db = create_db();
        create_items(&db);
        let mut reader = db.begin().unwrap();
        insert_item(&db, 1);

        assert_eq!(reader.table("items").unwrap().row_count().unwrap(), 0);
        let mut later = db.begin().unwrap();
        assert_eq!(later.table("items").unwrap().row_count().unwrap(), 1);
        reader.commit().unwrap();
    }

    #[test]
    fn commit_makes_rows_committed_added() {
        let db = create_db();
        create_items(&db);
        let mut txn = db.begin().unwrap();
        let row = txn.insert("items", &item(1, "a")).unwrap();
        let table = db.master_table("items").unwrap();
        assert_eq!(table.record_type(row).unwrap(), RowStatus::Uncommitted);

        let commit_id = db.commit(&mut txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(table.record_type(row).unwrap(), RowStatus::CommittedAdded);
        assert_eq!(db.last_commit(), commit_id);
    }

    #[test]
    fn rollback_discards_rows() {
        let db = create_db();
        create_items(&db);
        let mut txn = db.begin().unwrap();
        txn.insert("items", &item(1, "a")).unwrap();
        db.rollback(&mut txn).unwrap();
        assert_eq!(txn.state(), TransactionState::RolledBack);

        let table = db.master_table("items").unwrap();
        assert_eq!(table.pending_reclaim(), 1);
        assert_eq!(db.collect_garbage().unwrap(), 1);
        assert_eq!(table.slot_summary().free, 1);
        assert_eq!(db.stats().transactions_rolled_back, 1);
    }

    #[test]
    fn dropping_active_transaction_rolls_back() {
        let db = create_db();
        create_items(&db);
        {
            let mut txn = db.begin().unwrap();
            txn.insert("items", &item(1, "a")).unwrap();
        }
        let mut txn = db.begin().unwrap();
        assert_eq!(txn.table("items").unwrap().row_count().unwrap(), 0);
        assert_eq!(db.stats().transactions_rolled_back, 1);
    }

    #[test]
    fn concurrent_deletes_clash() {
        let db = create_db();
        create_items(&db);
        let row = insert_item(&db, 1);

        let mut a = db.begin().unwrap();
        let mut b = db.begin().unwrap();
        a.delete("items", row).unwrap();
        b.delete("items", row).unwrap();
        a.commit().unwrap();

        let table = db.master_table("items").unwrap();
        assert_eq!(table.record_type(row).unwrap(), RowStatus::CommittedRemoved);

        let err = b.commit().unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::RowClash));
        assert_eq!(b.state(), TransactionState::Aborted);
        assert_eq!(table.record_type(row).unwrap(), RowStatus::CommittedRemoved);
        assert_eq!(db.stats().conflicts, 1);

        assert_eq!(db.collect_garbage().unwrap(), 1);
    }

    #[test]
    fn concurrent_inserts_do_not_clash() {
        let db = create_db();
        create_items(&db);
        let mut a = db.begin().unwrap();
        let mut b = db.begin().unwrap();
        a.insert("items", &item(1, "a")).unwrap();
        b.insert("items", &item(2, "b")).unwrap();
        a.commit().unwrap();
        b.commit().unwrap();

        let mut txn = db.begin().unwrap();
        assert_eq!(txn.table("items").unwrap().row_count().unwrap(), 2);
    }

    #[test]
    fn dirty_select_aborts_reader() {
        let db = create_db();
        create_items(&db);
        db.transaction(|txn| {
            txn.create_table(
                TableSchema::new("log").column(ColumnDef::new("n", ColumnType::Integer)),
            )
        })
        .unwrap();

        let mut reader = db.begin().unwrap();
        assert_eq!(reader.table("items").unwrap().row_count().unwrap(), 0);
        insert_item(&db, 1);
        reader.insert("log", &[Value::Integer(0)]).unwrap();

        let err = reader.commit().unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::DirtySelect));
    }

    #[test]
    fn dirty_select_allowed_when_disabled() {
        let db = Database::open_with_store(
            Config::default().error_on_dirty_select(false),
            Arc::new(HeapAreaStore::new()),
            Arc::new(InMemoryBlobStore::new()),
        )
        .unwrap();
        create_items(&db);

        let mut reader = db.begin().unwrap();
        assert_eq!(reader.table("items").unwrap().row_count().unwrap(), 0);
        insert_item(&db, 1);
        reader.insert("items", &item(2, "b")).unwrap();
        reader.commit().unwrap();
    }

    #[test]
    fn namespace_clash_on_same_table_name() {
        let db = create_db();
        let mut a = db.begin().unwrap();
        let mut b = db.begin().unwrap();
        a.create_table(items_schema()).unwrap();
        b.create_table(items_schema()).unwrap();
        a.commit().unwrap();

        let err = b.commit().unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::NamespaceClash));
        assert_eq!(db.table_names(), vec!["items".to_string()]);
    }

    #[test]
    fn write_to_concurrently_dropped_table() {
        let db = create_db();
        create_items(&db);
        let mut writer = db.begin().unwrap();
        writer.insert("items", &item(1, "a")).unwrap();
        db.transaction(|txn| txn.drop_table("items")).unwrap();

        let err = writer.commit().unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::TableDropped));
    }

    #[test]
    fn drop_of_concurrently_modified_table() {
        let db = create_db();
        create_items(&db);
        let mut dropper = db.begin().unwrap();
        dropper.drop_table("items").unwrap();
        insert_item(&db, 1);

        let err = dropper.commit().unwrap_err();
        assert_eq!(err.conflict_kind(), Some(ConflictKind::DroppedTableModified));
        assert_eq!(db.table_names(), vec!["items".to_string()]);
    }

    #[test]
    fn dropped_table_storage_waits_for_readers() {
        let db = create_db();
        create_items(&db);
        insert_item(&db, 1);

        let mut reader = db.begin().unwrap();
        db.transaction(|txn| txn.drop_table("items")).unwrap();
        assert!(db.table_names().is_empty());
        assert_eq!(db.inner.catalog.read().dropped.len(), 1);
        assert_eq!(reader.table("items").unwrap().row_count().unwrap(), 1);

        drop(reader);
        db.collect_garbage().unwrap();
        assert!(db.inner.catalog.read().dropped.is_empty());
        assert!(db.inner.registry.lock().deleted().is_empty());
    }

    #[test]
    fn immediate_unique_violation_is_undone() {
        let db = create_db();
        create_items(&db);
        db.transaction(|txn| txn.add_constraint(Constraint::unique("items_id", "items", &["id"])))
            .unwrap();

        let mut txn = db.begin().unwrap();
        txn.insert("items", &item(1, "a")).unwrap();
        let err = txn.insert("items", &item(1, "b")).unwrap_err();
        assert!(err.is_constraint_violation());
        assert!(txn.is_active());
        assert_eq!(txn.table("items").unwrap().row_count().unwrap(), 1);
        txn.commit().unwrap();
    }

    #[test]
    fn deferred_foreign_key_checked_at_commit() {
        let db = create_db();
        db.transaction(|txn| {
            txn.create_table(
                TableSchema::new("parent")
                    .column(ColumnDef::new("id", ColumnType::Integer).indexed()),
            )?;
            txn.create_table(
                TableSchema::new("child").column(ColumnDef::new("parent_id", ColumnType::Integer)),
            )?;
            txn.add_constraint(
                Constraint::foreign_key("child_parent", "child", &["parent_id"], "parent", &["id"])
                    .deferred(),
            )
        })
        .unwrap();

        let mut txn = db.begin().unwrap();
        txn.insert("child", &[Value::Integer(7)]).unwrap();
        txn.insert("parent", &[Value::Integer(7)]).unwrap();
        txn.commit().unwrap();

        let mut txn = db.begin().unwrap();
        txn.insert("child", &[Value::Integer(8)]).unwrap();
        let err = txn.commit().unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(db.stats().constraint_violations, 1);

        let mut txn = db.begin().unwrap();
        assert_eq!(txn.table("child").unwrap().row_count().unwrap(), 1);
    }

    #[test]
    fn table_referenced_by_foreign_key_cannot_be_dropped() {
        let db = create_db();
        db.transaction(|txn| {
            txn.create_table(
                TableSchema::new("parent").column(ColumnDef::new("id", ColumnType::Integer)),
            )?;
            txn.create_table(
                TableSchema::new("child").column(ColumnDef::new("parent_id", ColumnType::Integer)),
            )?;
            txn.add_constraint(Constraint::foreign_key(
                "child_parent",
                "child",
                &["parent_id"],
                "parent",
                &["id"],
            ))
        })
        .unwrap();

        let mut txn = db.begin().unwrap();
        assert!(txn.drop_table("parent").unwrap_err().is_constraint_violation());
        txn.drop_table("child").unwrap();
        txn.drop_table("parent").unwrap();
        txn.commit().unwrap();
        assert!(db.table_names().is_empty());
    }

    #[test]
    fn removed_blob_rows_are_reclaimed_after_readers_finish() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let db = Database::open_with_store(
            Config::default(),
            Arc::new(HeapAreaStore::new()),
            blobs.clone(),
        )
        .unwrap();
        db.transaction(|txn| {
            txn.create_table(
                TableSchema::new("docs").column(ColumnDef::new("body", ColumnType::Blob)),
            )
        })
        .unwrap();

        let blob = blobs.put(b"payload".to_vec());
        let row = db
            .transaction(|txn| txn.insert("docs", &[Value::Blob(blob)]))
            .unwrap();
        assert_eq!(blobs.ref_count(blob), 1);

        let mut reader = db.begin().unwrap();
        db.transaction(|txn| txn.delete("docs", row)).unwrap();
        let table = db.master_table("docs").unwrap();
        assert_eq!(table.pending_reclaim(), 1);
        assert_eq!(reader.table("docs").unwrap().get_cell(row, 0).unwrap(), Value::Blob(blob));
        assert_eq!(blobs.ref_count(blob), 1);

        drop(reader);
        assert_eq!(db.collect_garbage().unwrap(), 1);
        assert_eq!(blobs.ref_count(blob), 0);

        let reused = db
            .transaction(|txn| txn.insert("docs", &[Value::Null]))
            .unwrap();
        assert_eq!(reused, row);
    }

    #[test]
    fn before_commit_handler_can_veto() {
        let db = create_db();
        create_items(&db);
        db.on_before_commit("items", |event| {
            if event.added.len() > 1 {
                Err(CoreError::invalid_operation("one row at a time"))
            } else {
                Ok(())
            }
        });

        insert_item(&db, 1);
        let mut txn = db.begin().unwrap();
        txn.insert("items", &item(2, "b")).unwrap();
        txn.insert("items", &item(3, "c")).unwrap();
        assert!(txn.commit().is_err());
        assert_eq!(db.stats().transactions_aborted, 1);

        let mut txn = db.begin().unwrap();
        assert_eq!(txn.table("items").unwrap().row_count().unwrap(), 1);
    }

    #[test]
    fn subscribers_see_committed_changes() {
        let db = create_db();
        create_items(&db);
        let rx = db.subscribe();
        let row = insert_item(&db, 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.table, "items");
        assert_eq!(event.added, vec![row]);
        assert!(event.removed.is_empty());
        assert_eq!(event.commit_id, db.last_commit());
    }

    #[test]
    fn update_replaces_row() {
        let db = create_db();
        create_items(&db);
        let row = insert_item(&db, 1);
        let replacement = db
            .transaction(|txn| txn.update("items", row, &item(1, "renamed")))
            .unwrap();
        assert_ne!(row, replacement);

        let mut txn = db.begin().unwrap();
        let view = txn.table("items").unwrap();
        assert_eq!(view.row_ids().unwrap(), vec![replacement]);
        assert_eq!(view.get_cell(replacement, 1).unwrap(), Value::Text("renamed".into()));
    }

    #[test]
    fn verify_and_repair_healthy_tables() {
        let db = create_db();
        create_items(&db);
        insert_item(&db, 1);
        insert_item(&db, 2);
        let reports = db.verify().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_healthy());
        assert_eq!(reports[0].live_rows, 2);

        let txn = db.begin().unwrap();
        assert!(matches!(db.verify(), Err(CoreError::InvalidOperation { .. })));
        assert!(db.repair().is_err());
        drop(txn);
        assert!(db.verify().unwrap().iter().all(TableReport::is_healthy));
        assert!(db.repair().unwrap().iter().all(TableReport::is_healthy));
    }

    #[test]
    fn drop_and_recreate_table_in_one_transaction() {
        let db = create_db();
        create_items(&db);
        insert_item(&db, 1);
        let old = db.master_table("items").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        db.on_before_commit("items", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut txn = db.begin().unwrap();
        txn.drop_table("items").unwrap();
        txn.create_table(items_schema()).unwrap();
        let row = txn.insert("items", &item(2, "new")).unwrap();
        txn.commit().unwrap();

        assert_eq!(db.table_names(), vec!["items".to_string()]);
        let table = db.master_table("items").unwrap();
        assert!(!Arc::ptr_eq(&table, &old));
        assert_ne!(table.id(), old.id());
        let visible: Vec<TableId> = db.inner.registry.lock().visible().iter().map(|e| e.id).collect();
        assert_eq!(visible, vec![table.id()]);

        let mut next = db.begin().unwrap();
        let view = next.table("items").unwrap();
        assert_eq!(view.row_ids().unwrap(), vec![row]);
        assert_eq!(view.get_cell(row, 1).unwrap(), Value::Text("new".into()));
        drop(next);

        insert_item(&db, 3);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn recreated_table_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.db");
        {
            let db = Database::open(&path).unwrap();
            create_items(&db);
            insert_item(&db, 1);
            db.transaction(|txn| {
                txn.drop_table("items")?;
                txn.create_table(items_schema())?;
                txn.insert("items", &item(2, "new"))?;
                txn.insert("items", &item(3, "new"))
            })
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.table_names(), vec!["items".to_string()]);
        let mut txn = db.begin().unwrap();
        let view = txn.table("items").unwrap();
        assert_eq!(view.row_count().unwrap(), 2);
        assert!(view.select_equal(0, &Value::Integer(1)).unwrap().is_empty());
    }

    #[test]
    fn aborted_commit_leaves_every_table_untouched() {
        let db = create_db();
        db.transaction(|txn| {
            txn.create_table(
                TableSchema::new("parent")
                    .column(ColumnDef::new("id", ColumnType::Integer).indexed()),
            )?;
            txn.create_table(
                TableSchema::new("child")
                    .column(ColumnDef::new("parent_id", ColumnType::Integer).indexed()),
            )?;
            txn.create_table(
                TableSchema::new("log").column(ColumnDef::new("n", ColumnType::Integer).indexed()),
            )?;
            txn.add_constraint(
                Constraint::foreign_key("child_parent", "child", &["parent_id"], "parent", &["id"])
                    .deferred(),
            )
        })
        .unwrap();
        let log_row = db
            .transaction(|txn| {
                txn.insert("parent", &[Value::Integer(1)])?;
                txn.insert("child", &[Value::Integer(1)])?;
                txn.insert("log", &[Value::Integer(0)])
            })
            .unwrap();

        let tables = ["child", "log", "parent"];
        let capture = |name: &str| {
            let table = db.master_table(name).unwrap();
            let store = &db.inner.env.store;
            (
                table.rows_by_status(),
                table.index_store().current_version(),
                store.read_area(table.header_area()).unwrap(),
                store.read_area(table.index_store().start_area()).unwrap(),
            )
        };
        let before: Vec<_> = tables.iter().map(|name| capture(*name)).collect();
        let last_commit = db.last_commit();

        let mut txn = db.begin().unwrap();
        let parent_row = txn.insert("parent", &[Value::Integer(2)]).unwrap();
        txn.delete("log", log_row).unwrap();
        let child_row = txn.insert("child", &[Value::Integer(99)]).unwrap();
        let err = txn.commit().unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(db.last_commit(), last_commit);

        for (name, (rows, version, header, start)) in tables.iter().zip(&before) {
            let (rows_now, version_now, header_now, start_now) = capture(*name);
            assert_eq!(&version_now, version, "{name} index nodes changed");
            assert_eq!(&header_now, header, "{name} table header changed");
            assert_eq!(&start_now, start, "{name} index header changed");
            let added: Vec<(RowId, RowStatus)> = rows_now
                .into_iter()
                .filter(|entry| !rows.contains(entry))
                .collect();
            for (row, status) in &added {
                assert!(*row == parent_row || *row == child_row, "{name}: unexpected {row}");
                assert_eq!(*status, RowStatus::CommittedRemoved);
            }
        }
        let log = db.master_table("log").unwrap();
        assert_eq!(log.record_type(log_row).unwrap(), RowStatus::CommittedAdded);

        db.collect_garbage().unwrap();
        let after: Vec<_> = tables.iter().map(|name| capture(*name)).collect();
        for (name, (now, then)) in tables.iter().zip(after.iter().zip(&before)) {
            assert_eq!(now.0, then.0, "{name} rows differ after reclaim");
        }
    }

    #[test]
    fn storage_failure_while_applying_closes_database() {
        let store = Arc::new(FaultyStore::default());
        let db = Database::open_with_store(
            Config::default(),
            store.clone(),
            Arc::new(InMemoryBlobStore::new()),
        )
        .unwrap();
        db.transaction(|txn| {
            txn.create_table(TableSchema::new("a").column(ColumnDef::new("n", ColumnType::Integer)))
        })
        .unwrap();

        let mut txn = db.begin().unwrap();
        store.start_recording();
        txn.create_table(TableSchema::new("b").column(ColumnDef::new("n", ColumnType::Integer)))
            .unwrap();
        txn.insert("b", &[Value::Integer(0)]).unwrap();
        let b_areas = store.stop_recording();
        txn.commit().unwrap();

        let mut bystander = db.begin().unwrap();
        let mut txn = db.begin().unwrap();
        let a_row = txn.insert("a", &[Value::Integer(1)]).unwrap();
        let b_row = txn.insert("b", &[Value::Integer(1)]).unwrap();
        bystander.insert("a", &[Value::Integer(2)]).unwrap();
        store.fail_writes_to(&b_areas);
        let failed_at = db.last_commit().next();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(txn.state(), TransactionState::Failed);
        assert!(!db.is_open());
        assert_eq!(db.last_commit(), failed_at);
        assert_eq!(db.master_table("a").unwrap().record_type(a_row).unwrap(), RowStatus::CommittedAdded);
        assert_eq!(db.master_table("b").unwrap().record_type(b_row).unwrap(), RowStatus::Uncommitted);

        assert!(matches!(db.begin(), Err(CoreError::DatabaseClosed)));
        assert!(matches!(bystander.commit(), Err(CoreError::DatabaseClosed)));
        assert_eq!(db.stats().checkpoints, 2);
    }

    #[test]
    fn transaction_cannot_commit_after_close() {
        let db = create_db();
        create_items(&db);
        let mut txn = db.begin().unwrap();
        txn.insert("items", &item(1, "a")).unwrap();
        db.close().unwrap();
        let checkpoints = db.stats().checkpoints;

        assert!(matches!(txn.commit(), Err(CoreError::DatabaseClosed)));
        assert_eq!(db.stats().checkpoints, checkpoints);
        assert_eq!(db.last_commit(), CommitId::new(1));
    }

    #[test]
    fn reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.db");
        {
            let db = Database::open(&path).unwrap();
            create_items(&db);
            insert_item(&db, 1);
            insert_item(&db, 2);
        }

        assert!(Database::open_with_config(&path, Config::default().error_if_exists(true)).is_err());

        let db = Database::open(&path).unwrap();
        let mut txn = db.begin().unwrap();
        let view = txn.table("items").unwrap();
        assert_eq!(view.row_count().unwrap(), 2);
        assert_eq!(view.select_equal(0, &Value::Integer(2)).unwrap().len(), 1);
        assert!(db.last_commit() > CommitId::ZERO);
    }

    #[test]
    fn missing_file_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");
        let config = Config::default().create_if_missing(false);
        assert!(Database::open_with_config(&path, config).is_err());
    }
}

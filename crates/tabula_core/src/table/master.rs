//! Master table data source: the shared, persisted form of a table.
//!
//! ## Table header
//!
//! ```text
//! | magic "TBMT" (4) | version (4) | table id (4) | unique id sequence (8) |
//! | slot header ptr (8) | index set start ptr (8) | schema ptr (8) |
//! ```

use super::gc::RowGarbageCollector;
use super::journal::MasterTableJournal;
use super::record;
use super::slots::{RowStatus, SlotList};
use crate::blob::BlobStore;
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexSet, IndexSetStore};
use crate::schema::TableSchema;
use crate::stats::DatabaseStats;
use crate::types::{CommitId, RowId, TableId};
use crate::value::{BlobRef, Value};
use bytes::BufMut;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tabula_storage::{AreaId, AreaStore, MutableArea};

/// Magic value of a table header: "TBMT".
const TABLE_MAGIC: i32 = 0x5442_4D54;

/// Current table format version.
const TABLE_VERSION: i32 = 1;

const TABLE_HEADER_SIZE: usize = 44;
const UNIQUE_ID_OFFSET: usize = 12;

/// Shared services every master table needs.
#[derive(Clone)]
pub(crate) struct TableEnv {
    pub(crate) store: Arc<dyn AreaStore>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) stats: Arc<DatabaseStats>,
    pub(crate) index_block_size: usize,
    pub(crate) cell_cache_capacity: usize,
}

#[derive(Debug)]
struct TableState {
    slots: SlotList,
    unique_id: i64,
}

/// Counts of slot states, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotSummary {
    /// Slots ever allocated.
    pub slots: usize,
    /// Free slots.
    pub free: usize,
    /// Rows not yet committed.
    pub uncommitted: usize,
    /// Committed rows.
    pub committed_added: usize,
    /// Removed rows waiting for reclaim.
    pub committed_removed: usize,
}

/// The permanent representation of one table.
///
/// Rows are written once and never changed in place: an update adds a new
/// row and removes the old one. A row's slot is only reused after the
/// garbage collector reclaims it.
pub struct MasterTable {
    id: TableId,
    schema: Arc<TableSchema>,
    env: TableEnv,
    header_area: AreaId,
    schema_area: AreaId,
    state: Mutex<TableState>,
    index_store: Arc<IndexSetStore>,
    cache: Option<Mutex<LruCache<(RowId, usize), Value>>>,
    journals: RwLock<Vec<Arc<MasterTableJournal>>>,
    gc: RowGarbageCollector,
}

impl std::fmt::Debug for MasterTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterTable")
            .field("id", &self.id)
            .field("name", &self.schema.name)
            .field("header_area", &self.header_area)
            .finish_non_exhaustive()
    }
}

fn new_cache(capacity: usize) -> Option<Mutex<LruCache<(RowId, usize), Value>>> {
    NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)))
}

impl MasterTable {
    /// Allocates the storage of a new, empty table.
    pub(crate) fn create(env: &TableEnv, id: TableId, schema: TableSchema) -> CoreResult<Arc<Self>> {
        schema.validate()?;
        let store = env.store.as_ref();
        let _lock = store.lock_for_write();

        let schema_area = store.create_area_with(&schema.to_bytes()?)?;
        let slots = SlotList::create(store)?;
        let index_start =
            IndexSetStore::create(store, schema.index_count(), env.index_block_size)?;

        let mut header = Vec::with_capacity(TABLE_HEADER_SIZE);
        header.put_i32(TABLE_MAGIC);
        header.put_i32(TABLE_VERSION);
        header.put_i32(id.as_u32() as i32);
        header.put_i64(0);
        header.put_i64(AreaId::to_pointer(Some(slots.header_area())));
        header.put_i64(AreaId::to_pointer(Some(index_start)));
        header.put_i64(AreaId::to_pointer(Some(schema_area)));
        let header_area = store.create_area_with(&header)?;

        let index_store = IndexSetStore::open(Arc::clone(&env.store), index_start)?;
        tracing::debug!(table = %schema.name, %id, %header_area, "created table");

        Ok(Arc::new(Self {
            id,
            schema: Arc::new(schema),
            env: env.clone(),
            header_area,
            schema_area,
            state: Mutex::new(TableState {
                slots,
                unique_id: 0,
            }),
            index_store,
            cache: new_cache(env.cell_cache_capacity),
            journals: RwLock::new(Vec::new()),
            gc: RowGarbageCollector::new(),
        }))
    }

    /// Loads the table whose header is `header_area`.
    pub(crate) fn open(env: &TableEnv, header_area: AreaId) -> CoreResult<Arc<Self>> {
        let store = env.store.as_ref();
        let mut header = MutableArea::open(store, header_area)?;
        let magic = header.get_i32()?;
        if magic != TABLE_MAGIC {
            return Err(CoreError::invalid_format(format!(
                "{header_area} is not a table header (magic {magic:#010x})"
            )));
        }
        let version = header.get_i32()?;
        if version != TABLE_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported table version {version}"
            )));
        }
        let id = TableId::new(header.get_i32()? as u32);
        let unique_id = header.get_i64()?;
        let missing = |what: &str| CoreError::corruption(format!("table {id} has no {what}"));
        let slot_header = AreaId::from_pointer(header.get_i64()?).ok_or_else(|| missing("slots"))?;
        let index_start =
            AreaId::from_pointer(header.get_i64()?).ok_or_else(|| missing("index set"))?;
        let schema_area =
            AreaId::from_pointer(header.get_i64()?).ok_or_else(|| missing("schema"))?;

        let schema = TableSchema::from_bytes(&store.read_area(schema_area)?)?;
        let slots = SlotList::open(store, slot_header)?;
        let index_store = IndexSetStore::open(Arc::clone(&env.store), index_start)?;
        if index_store.index_count() != schema.index_count() {
            return Err(CoreError::corruption(format!(
                "table {} has {} index lists, schema needs {}",
                schema.name,
                index_store.index_count(),
                schema.index_count()
            )));
        }

        Ok(Arc::new(Self {
            id,
            schema: Arc::new(schema),
            env: env.clone(),
            header_area,
            schema_area,
            state: Mutex::new(TableState { slots, unique_id }),
            index_store,
            cache: new_cache(env.cell_cache_capacity),
            journals: RwLock::new(Vec::new()),
            gc: RowGarbageCollector::new(),
        }))
    }

    /// Table id.
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Table schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Table header area.
    #[must_use]
    pub fn header_area(&self) -> AreaId {
        self.header_area
    }

    pub(crate) fn index_store(&self) -> &Arc<IndexSetStore> {
        &self.index_store
    }

    /// Counts slots by state.
    #[must_use]
    pub fn slot_summary(&self) -> SlotSummary {
        let state = self.state.lock();
        let mut summary = SlotSummary {
            slots: state.slots.len(),
            free: state.slots.free_count(),
            ..SlotSummary::default()
        };
        for (_, status, _) in state.slots.rows() {
            match status {
                RowStatus::Uncommitted => summary.uncommitted += 1,
                RowStatus::CommittedAdded => summary.committed_added += 1,
                RowStatus::CommittedRemoved => summary.committed_removed += 1,
            }
        }
        summary
    }

    /// Writes a new uncommitted row and returns its id.
    ///
    /// The row is not added to any index; the caller records it in a
    /// journal. Each blob cell gains one reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the row doesn't match the schema, a blob is
    /// unknown, or the area store fails.
    pub fn add_row(&self, values: &[Value]) -> CoreResult<RowId> {
        self.schema.validate_row(values)?;
        let data = record::encode_row(values)?;
        let blobs: Vec<BlobRef> = values.iter().filter_map(Value::as_blob).collect();

        let store = self.env.store.as_ref();
        let _lock = store.lock_for_write();
        let area = store.create_area_with(&data)?;
        if let Err(err) = self.establish_row(&blobs) {
            self.delete_area_quietly(area);
            return Err(err);
        }
        let row = match self.state.lock().slots.allocate(store, area) {
            Ok(row) => row,
            Err(err) => {
                self.release_row(&blobs);
                self.delete_area_quietly(area);
                return Err(err);
            }
        };
        self.env.stats.record_rows_added(1);
        Ok(row)
    }

    /// Entry point of a row's lifetime: takes a reference on every blob.
    fn establish_row(&self, blobs: &[BlobRef]) -> CoreResult<()> {
        for (i, blob) in blobs.iter().enumerate() {
            if let Err(err) = self.env.blobs.establish_reference(*blob) {
                self.release_row(&blobs[..i]);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Exit point of a row's lifetime: drops the references taken by
    /// [`MasterTable::establish_row`].
    fn release_row(&self, blobs: &[BlobRef]) {
        for blob in blobs {
            if let Err(err) = self.env.blobs.release_reference(*blob) {
                tracing::warn!(table = %self.name(), blob = blob.id, error = %err, "failed to release blob");
            }
        }
    }

    fn read_record(&self, row: RowId) -> CoreResult<bytes::Bytes> {
        let area = self.state.lock().slots.data_area(row)?;
        Ok(self.env.store.read_area(area)?)
    }

    /// Reads one cell of a row, whatever its commit state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the row's slot is free.
    pub fn get_cell(&self, row: RowId, column: usize) -> CoreResult<Value> {
        if let Some(cache) = &self.cache {
            if let Some(value) = cache.lock().get(&(row, column)) {
                self.env.stats.record_cache_hit();
                return Ok(value.clone());
            }
            self.env.stats.record_cache_miss();
        }
        let data = self.read_record(row)?;
        let value = record::decode_cell(&data, self.schema.column_count(), column)?;
        if let Some(cache) = &self.cache {
            cache.lock().put((row, column), value.clone());
        }
        Ok(value)
    }

    /// Reads every cell of a row.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the row's slot is free.
    pub fn get_row(&self, row: RowId) -> CoreResult<Vec<Value>> {
        let data = self.read_record(row)?;
        record::decode_row(&data, self.schema.column_count())
    }

    /// Commit state of a row.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the row's slot is free.
    pub fn record_type(&self, row: RowId) -> CoreResult<RowStatus> {
        self.state.lock().slots.status(row)
    }

    /// Rewrites the commit state of a row.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the row's slot is free.
    pub fn write_record_type(&self, row: RowId, status: RowStatus) -> CoreResult<()> {
        let store = self.env.store.as_ref();
        let _lock = store.lock_for_write();
        self.state.lock().slots.set_status(store, row, status)
    }

    /// Advances and returns the table's unique id sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn next_unique_id(&self) -> CoreResult<i64> {
        let store = self.env.store.as_ref();
        let _lock = store.lock_for_write();
        let mut state = self.state.lock();
        let next = state.unique_id + 1;
        let mut header = MutableArea::open(store, self.header_area)?;
        header.set_position(UNIQUE_ID_OFFSET)?;
        header.put_i64(next)?;
        state.unique_id = next;
        Ok(next)
    }

    /// Takes a snapshot of the table's indexes.
    ///
    /// # Errors
    ///
    /// Returns an error if the table's storage was dropped.
    pub fn create_index_set(&self) -> CoreResult<IndexSet> {
        self.index_store.snapshot()
    }

    /// Persists the changed lists of `set`.
    ///
    /// # Errors
    ///
    /// Returns an error if `set` is stale or the area store fails.
    pub fn commit_index_set(&self, set: &IndexSet) -> CoreResult<()> {
        self.index_store.commit_index_set(set)
    }

    /// Checks that [`MasterTable::commit_index_set`] would accept `set`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `set` is stale or the table's storage
    /// was dropped.
    pub fn check_index_set(&self, set: &IndexSet) -> CoreResult<()> {
        self.index_store.check_committable(set)
    }

    /// Flips one row from `from` to `to`.
    ///
    /// # Panics
    ///
    /// Panics if the row is not in state `from`: the journal and the slot
    /// list disagree, which means a bug or a corrupted table.
    fn flip(&self, slots: &mut SlotList, row: RowId, from: RowStatus, to: RowStatus) -> CoreResult<()> {
        let current = match slots.status(row) {
            Ok(status) => status,
            Err(err) => panic!("table {}: {row} cannot change state: {err}", self.name()),
        };
        assert_eq!(
            current, from,
            "table {}: {row} expected {from:?}, found {current:?}",
            self.name()
        );
        slots.set_status(self.env.store.as_ref(), row, to)
    }

    /// Makes a transaction's changes permanent.
    ///
    /// Rows the journal adds become committed-added, rows it removes become
    /// committed-removed and are queued for reclaim, and `set` (already
    /// holding the journal applied to the latest index state) is persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the area store fails.
    ///
    /// # Panics
    ///
    /// Panics if a row is not in the state the journal implies.
    pub fn commit_transaction_change(
        &self,
        commit_id: CommitId,
        mut journal: MasterTableJournal,
        set: &IndexSet,
    ) -> CoreResult<()> {
        {
            let _lock = self.env.store.lock_for_write();
            let mut state = self.state.lock();
            for entry in journal.entries() {
                if entry.command.is_add() {
                    self.flip(
                        &mut state.slots,
                        entry.row,
                        RowStatus::Uncommitted,
                        RowStatus::CommittedAdded,
                    )?;
                } else {
                    self.flip(
                        &mut state.slots,
                        entry.row,
                        RowStatus::CommittedAdded,
                        RowStatus::CommittedRemoved,
                    )?;
                }
            }
        }
        self.commit_index_set(set)?;

        let removed: Vec<RowId> = journal.removed_rows().collect();
        self.env.stats.record_rows_removed(removed.len() as u64);
        self.gc.mark_removed(commit_id, removed);

        journal.set_commit_id(commit_id);
        self.journals.write().push(Arc::new(journal));
        tracing::debug!(table = %self.name(), %commit_id, "committed table change");
        Ok(())
    }

    /// Hides the rows a rolled-back journal added and queues them for
    /// reclaim.
    ///
    /// # Errors
    ///
    /// Returns an error if the area store fails.
    ///
    /// # Panics
    ///
    /// Panics if an added row is not uncommitted.
    pub fn rollback_transaction_change(&self, journal: &MasterTableJournal) -> CoreResult<()> {
        let rows: Vec<RowId> = journal.added_rows().collect();
        self.abandon_rows(&rows)
    }

    /// Flips uncommitted rows to committed-removed and queues them.
    pub(crate) fn abandon_rows(&self, rows: &[RowId]) -> CoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        {
            let _lock = self.env.store.lock_for_write();
            let mut state = self.state.lock();
            for row in rows {
                self.flip(
                    &mut state.slots,
                    *row,
                    RowStatus::Uncommitted,
                    RowStatus::CommittedRemoved,
                )?;
            }
        }
        self.gc.mark_abandoned(rows.iter().copied());
        Ok(())
    }

    /// Committed journals newer than `commit_id`, oldest first.
    #[must_use]
    pub fn journals_since(&self, commit_id: CommitId) -> Vec<Arc<MasterTableJournal>> {
        self.journals
            .read()
            .iter()
            .filter(|j| j.commit_id().is_some_and(|c| c > commit_id))
            .cloned()
            .collect()
    }

    /// Whether any commit after `commit_id` changed this table.
    #[must_use]
    pub fn changed_since(&self, commit_id: CommitId) -> bool {
        self.journals
            .read()
            .iter()
            .any(|j| j.commit_id().is_some_and(|c| c > commit_id))
    }

    /// Forgets journals no open transaction needs for clash checks.
    /// Returns whether the history is now empty.
    pub fn merge_journal_changes(&self, min_snapshot: CommitId) -> bool {
        let mut journals = self.journals.write();
        journals.retain(|j| j.commit_id().is_some_and(|c| c > min_snapshot));
        journals.is_empty()
    }

    /// Rows waiting for reclaim.
    #[must_use]
    pub fn pending_reclaim(&self) -> usize {
        self.gc.pending_count()
    }

    /// Reclaims every queued row no snapshot at or after `min_snapshot`
    /// can see. Returns the number of rows reclaimed.
    ///
    /// # Errors
    ///
    /// Returns the first area store error; unreclaimed rows stay queued.
    pub fn collect_garbage(&self, min_snapshot: CommitId) -> CoreResult<usize> {
        let rows = self.gc.take_reclaimable(min_snapshot);
        let mut reclaimed = 0;
        for (i, row) in rows.iter().enumerate() {
            if let Err(err) = self.reclaim_row(*row) {
                self.gc.requeue(rows[i..].iter().copied());
                self.env.stats.record_rows_reclaimed(reclaimed as u64);
                return Err(err);
            }
            reclaimed += 1;
        }
        if reclaimed > 0 {
            self.env.stats.record_rows_reclaimed(reclaimed as u64);
            tracing::debug!(table = %self.name(), reclaimed, "collected garbage rows");
        }
        Ok(reclaimed)
    }

    /// Frees the slot of a committed-removed row, deletes its record and
    /// releases its blobs.
    ///
    /// # Panics
    ///
    /// Panics if the row is not committed-removed.
    fn reclaim_row(&self, row: RowId) -> CoreResult<()> {
        let store = self.env.store.as_ref();
        let _lock = store.lock_for_write();
        let blobs = {
            let mut state = self.state.lock();
            let status = match state.slots.status(row) {
                Ok(status) => status,
                Err(err) => panic!("table {}: reclaiming {row}: {err}", self.name()),
            };
            assert_eq!(
                status,
                RowStatus::CommittedRemoved,
                "table {}: reclaiming {row} in state {status:?}",
                self.name()
            );
            let area = state.slots.data_area(row)?;
            let data = store.read_area(area)?;
            let blobs = record::blob_refs(&data, self.schema.column_count())?;
            state.slots.free(store, row)?;
            self.delete_area_quietly(area);
            blobs
        };
        self.release_row(&blobs);
        self.invalidate_row(row);
        Ok(())
    }

    fn invalidate_row(&self, row: RowId) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            for column in 0..self.schema.column_count() {
                cache.pop(&(row, column));
            }
        }
    }

    /// Brings the table to a clean state after open: rows left uncommitted
    /// by an interrupted transaction are abandoned and every removed row is
    /// reclaimed. Returns the number of rows reclaimed.
    pub(crate) fn recover(&self) -> CoreResult<usize> {
        let (uncommitted, removed): (Vec<RowId>, Vec<RowId>) = {
            let state = self.state.lock();
            let mut uncommitted = Vec::new();
            let mut removed = Vec::new();
            for (row, status, _) in state.slots.rows() {
                match status {
                    RowStatus::Uncommitted => uncommitted.push(row),
                    RowStatus::CommittedRemoved => removed.push(row),
                    RowStatus::CommittedAdded => {}
                }
            }
            (uncommitted, removed)
        };
        self.abandon_rows(&uncommitted)?;
        self.gc.mark_abandoned(removed);
        let reclaimed = self.collect_garbage(CommitId::ZERO)?;
        if reclaimed > 0 {
            tracing::info!(table = %self.name(), reclaimed, abandoned = uncommitted.len(), "recovered table");
        }
        Ok(reclaimed)
    }

    /// Rows currently in each state, for maintenance.
    pub(crate) fn rows_by_status(&self) -> Vec<(RowId, RowStatus)> {
        self.state
            .lock()
            .slots
            .rows()
            .map(|(row, status, _)| (row, status))
            .collect()
    }

    /// Walks the free chain.
    pub(crate) fn free_chain(&self) -> CoreResult<Vec<RowId>> {
        self.state.lock().slots.free_chain()
    }

    /// Relinks the free chain from slot states.
    pub(crate) fn rebuild_free_chain(&self) -> CoreResult<usize> {
        let store = self.env.store.as_ref();
        let _lock = store.lock_for_write();
        self.state.lock().slots.rebuild_free_chain(store)
    }

    /// Deletes every area of the table, releasing the blobs its rows hold.
    ///
    /// # Errors
    ///
    /// Returns the first error; the remaining storage is still released.
    pub(crate) fn drop_storage(&self) -> CoreResult<()> {
        let store = self.env.store.as_ref();
        let _lock = store.lock_for_write();
        let mut first_err: Option<CoreError> = None;
        let mut blobs = Vec::new();
        {
            let mut state = self.state.lock();
            for (_, _, area) in state.slots.rows() {
                match store
                    .read_area(area)
                    .map_err(CoreError::from)
                    .and_then(|data| record::blob_refs(&data, self.schema.column_count()))
                {
                    Ok(refs) => blobs.extend(refs),
                    Err(err) => {
                        first_err.get_or_insert(err);
                    }
                }
                self.delete_area_quietly(area);
            }
            if let Err(err) = state.slots.drop_storage(store) {
                first_err.get_or_insert(err);
            }
        }
        self.release_row(&blobs);
        self.index_store.drop_all();
        self.delete_area_quietly(self.schema_area);
        self.delete_area_quietly(self.header_area);
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
        tracing::debug!(table = %self.name(), "dropped table storage");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn delete_area_quietly(&self, area: AreaId) {
        if let Err(err) = self.env.store.delete_area(area) {
            tracing::warn!(table = %self.name(), %area, error = %err, "failed to delete area");
        }
    }
}

//! Persistent table registry.
//!
//! The store's root area holds the registry header:
//!
//! ```text
//! | magic "TBRG" (4) | version (4) | next table id (4) | last commit (8) | table list ptr (8) |
//! ```
//!
//! The next table id and last commit are updated in place. The table list
//! is rewritten to a new area whenever a commit creates or drops tables:
//!
//! ```text
//! | visible count (4) | { table id (4) | header ptr (8) } * n |
//! | deleted count (4) | { table id (4) | header ptr (8) | dropped at (8) } * n |
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::{CommitId, TableId};
use bytes::BufMut;
use std::sync::Arc;
use tabula_storage::{AreaId, AreaStore, MutableArea};

const REGISTRY_MAGIC: i32 = 0x5442_5247;
const REGISTRY_VERSION: i32 = 1;
const NEXT_TABLE_ID_OFFSET: usize = 8;
const LAST_COMMIT_OFFSET: usize = 12;
const LIST_POINTER_OFFSET: usize = 20;
const HEADER_SIZE: usize = 28;

/// A table visible to new transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    /// Table id.
    pub id: TableId,
    /// Table header area.
    pub header: AreaId,
}

/// A dropped table whose storage may still be seen by old snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedEntry {
    /// Table id.
    pub id: TableId,
    /// Table header area.
    pub header: AreaId,
    /// Commit that dropped it.
    pub dropped_at: CommitId,
}

/// In-memory mirror of the persisted registry.
pub(crate) struct Registry {
    store: Arc<dyn AreaStore>,
    root: AreaId,
    list_area: AreaId,
    next_table_id: u32,
    last_commit: CommitId,
    visible: Vec<TableEntry>,
    deleted: Vec<DeletedEntry>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("root", &self.root)
            .field("next_table_id", &self.next_table_id)
            .field("last_commit", &self.last_commit)
            .field("visible", &self.visible.len())
            .field("deleted", &self.deleted.len())
            .finish()
    }
}

fn encode_list(visible: &[TableEntry], deleted: &[DeletedEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + visible.len() * 12 + deleted.len() * 20);
    buf.put_i32(visible.len() as i32);
    for entry in visible {
        buf.put_i32(entry.id.as_u32() as i32);
        buf.put_i64(AreaId::to_pointer(Some(entry.header)));
    }
    buf.put_i32(deleted.len() as i32);
    for entry in deleted {
        buf.put_i32(entry.id.as_u32() as i32);
        buf.put_i64(AreaId::to_pointer(Some(entry.header)));
        buf.put_i64(entry.dropped_at.as_u64() as i64);
    }
    buf
}

fn header_pointer(raw: i64) -> CoreResult<AreaId> {
    AreaId::from_pointer(raw).ok_or_else(|| CoreError::corruption("registry entry without a table header"))
}

impl Registry {
    /// Writes an empty registry and makes it the store's root.
    pub(crate) fn create(store: Arc<dyn AreaStore>) -> CoreResult<Self> {
        let (root, list_area) = {
            let _lock = store.lock_for_write();
            let list_area = store.create_area_with(&encode_list(&[], &[]))?;
            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.put_i32(REGISTRY_MAGIC);
            header.put_i32(REGISTRY_VERSION);
            header.put_i32(1);
            header.put_i64(0);
            header.put_i64(AreaId::to_pointer(Some(list_area)));
            let root = store.create_area_with(&header)?;
            store.set_root_area(Some(root))?;
            (root, list_area)
        };
        Ok(Self {
            store,
            root,
            list_area,
            next_table_id: 1,
            last_commit: CommitId::ZERO,
            visible: Vec::new(),
            deleted: Vec::new(),
        })
    }

    /// Loads the registry at `root`.
    pub(crate) fn open(store: Arc<dyn AreaStore>, root: AreaId) -> CoreResult<Self> {
        let (next_table_id, last_commit, list_area) = {
            let mut header = MutableArea::open(store.as_ref(), root)?;
            let magic = header.get_i32()?;
            if magic != REGISTRY_MAGIC {
                return Err(CoreError::invalid_format(format!(
                    "root {root} is not a table registry (magic {magic:#010x})"
                )));
            }
            let version = header.get_i32()?;
            if version != REGISTRY_VERSION {
                return Err(CoreError::invalid_format(format!(
                    "unsupported registry version {version}"
                )));
            }
            let next_table_id = header.get_i32()? as u32;
            let last_commit = CommitId::new(header.get_i64()? as u64);
            let list_area = AreaId::from_pointer(header.get_i64()?)
                .ok_or_else(|| CoreError::corruption("registry has no table list"))?;
            (next_table_id, last_commit, list_area)
        };

        let mut list = MutableArea::open(store.as_ref(), list_area)?;
        let visible_count = list.get_i32()?;
        let mut visible = Vec::new();
        for _ in 0..visible_count {
            let id = TableId::new(list.get_i32()? as u32);
            let header = header_pointer(list.get_i64()?)?;
            visible.push(TableEntry { id, header });
        }
        let deleted_count = list.get_i32()?;
        let mut deleted = Vec::new();
        for _ in 0..deleted_count {
            let id = TableId::new(list.get_i32()? as u32);
            let header = header_pointer(list.get_i64()?)?;
            let dropped_at = CommitId::new(list.get_i64()? as u64);
            deleted.push(DeletedEntry {
                id,
                header,
                dropped_at,
            });
        }
        drop(list);

        Ok(Self {
            store,
            root,
            list_area,
            next_table_id,
            last_commit,
            visible,
            deleted,
        })
    }

    pub(crate) fn visible(&self) -> &[TableEntry] {
        &self.visible
    }

    pub(crate) fn deleted(&self) -> &[DeletedEntry] {
        &self.deleted
    }

    pub(crate) fn last_commit(&self) -> CommitId {
        self.last_commit
    }

    /// Reserves a table id. Ids are never reused, even when the creating
    /// transaction rolls back.
    pub(crate) fn allocate_table_id(&mut self) -> CoreResult<TableId> {
        let id = TableId::new(self.next_table_id);
        let mut header = MutableArea::open(self.store.as_ref(), self.root)?;
        header.set_position(NEXT_TABLE_ID_OFFSET)?;
        header.put_i32((self.next_table_id + 1) as i32)?;
        self.next_table_id += 1;
        Ok(id)
    }

    /// Records `commit_id` as the last commit.
    pub(crate) fn record_commit(&mut self, commit_id: CommitId) -> CoreResult<()> {
        let mut header = MutableArea::open(self.store.as_ref(), self.root)?;
        header.set_position(LAST_COMMIT_OFFSET)?;
        header.put_i64(commit_id.as_u64() as i64)?;
        self.last_commit = commit_id;
        Ok(())
    }

    /// Publishes created tables and moves dropped ones to the deleted list.
    pub(crate) fn apply(
        &mut self,
        created: &[TableEntry],
        dropped: &[TableId],
        commit_id: CommitId,
    ) -> CoreResult<()> {
        if created.is_empty() && dropped.is_empty() {
            return Ok(());
        }
        let mut visible = self.visible.clone();
        let mut deleted = self.deleted.clone();
        visible.retain(|entry| {
            if dropped.contains(&entry.id) {
                deleted.push(DeletedEntry {
                    id: entry.id,
                    header: entry.header,
                    dropped_at: commit_id,
                });
                false
            } else {
                true
            }
        });
        visible.extend_from_slice(created);
        self.rewrite(visible, deleted)
    }

    /// Forgets deleted tables whose storage was released.
    pub(crate) fn forget_deleted(&mut self, ids: &[TableId]) -> CoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let visible = self.visible.clone();
        let deleted = self
            .deleted
            .iter()
            .filter(|e| !ids.contains(&e.id))
            .copied()
            .collect();
        self.rewrite(visible, deleted)
    }

    fn rewrite(&mut self, visible: Vec<TableEntry>, deleted: Vec<DeletedEntry>) -> CoreResult<()> {
        let store = self.store.as_ref();
        let _lock = store.lock_for_write();
        let list_area = store.create_area_with(&encode_list(&visible, &deleted))?;
        let mut header = MutableArea::open(store, self.root)?;
        header.set_position(LIST_POINTER_OFFSET)?;
        header.put_i64(AreaId::to_pointer(Some(list_area)))?;

        let old = std::mem::replace(&mut self.list_area, list_area);
        if let Err(err) = store.delete_area(old) {
            tracing::warn!(area = %old, error = %err, "failed to delete old table list");
        }
        self.visible = visible;
        self.deleted = deleted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_storage::HeapAreaStore;

    #[test]
    fn create_then_reopen() {
        let store: Arc<dyn AreaStore> = Arc::new(HeapAreaStore::new());
        let mut registry = Registry::create(Arc::clone(&store)).unwrap();
        let a = registry.allocate_table_id().unwrap();
        let b = registry.allocate_table_id().unwrap();
        assert_eq!((a, b), (TableId::new(1), TableId::new(2)));

        registry
            .apply(
                &[
                    TableEntry { id: a, header: AreaId::new(100) },
                    TableEntry { id: b, header: AreaId::new(200) },
                ],
                &[],
                CommitId::new(1),
            )
            .unwrap();
        registry.apply(&[], &[a], CommitId::new(2)).unwrap();
        registry.record_commit(CommitId::new(2)).unwrap();

        let root = store.root_area().unwrap();
        let reopened = Registry::open(Arc::clone(&store), root).unwrap();
        assert_eq!(reopened.last_commit(), CommitId::new(2));
        assert_eq!(reopened.visible(), &[TableEntry { id: b, header: AreaId::new(200) }]);
        assert_eq!(
            reopened.deleted(),
            &[DeletedEntry {
                id: a,
                header: AreaId::new(100),
                dropped_at: CommitId::new(2)
            }]
        );
        let mut reopened = reopened;
        assert_eq!(reopened.allocate_table_id().unwrap(), TableId::new(3));
        reopened.forget_deleted(&[a]).unwrap();
        assert!(reopened.deleted().is_empty());
    }

    #[test]
    fn list_rewrites_do_not_leak_areas() {
        let heap = Arc::new(HeapAreaStore::new());
        let mut registry = Registry::create(heap.clone()).unwrap();
        let baseline = heap.area_count();
        for n in 0..5 {
            let id = registry.allocate_table_id().unwrap();
            registry
                .apply(&[TableEntry { id, header: AreaId::new(n) }], &[], CommitId::new(n + 1))
                .unwrap();
        }
        assert_eq!(heap.area_count(), baseline);
    }

    #[test]
    fn rejects_foreign_root() {
        let store: Arc<dyn AreaStore> = Arc::new(HeapAreaStore::new());
        let bogus = store.create_area_with(&[0u8; HEADER_SIZE]).unwrap();
        assert!(matches!(
            Registry::open(store, bogus),
            Err(CoreError::InvalidFormat { .. })
        ));
    }
}

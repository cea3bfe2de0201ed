//! In-memory area store.

use crate::area::{AreaId, AreaStore, WriteLock};
use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use parking_lot::{ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-memory area store.
///
/// This store keeps every area in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral databases that don't need persistence
///
/// It is also the working set of [`super::FileAreaStore`], which persists
/// an image of it on checkpoint.
///
/// # Example
///
/// ```rust
/// use tabula_storage::{AreaStore, HeapAreaStore};
///
/// let store = HeapAreaStore::new();
/// let id = store.create_area_with(b"row").unwrap();
/// assert_eq!(store.area_size(id).unwrap(), 3);
/// ```
#[derive(Debug)]
pub struct HeapAreaStore {
    areas: RwLock<HashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,
    root: RwLock<Option<AreaId>>,
    write_lock: ReentrantMutex<()>,
    checkpoints: AtomicU64,
}

impl Default for HeapAreaStore {
    fn default() -> Self {
        Self {
            areas: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            root: RwLock::new(None),
            write_lock: ReentrantMutex::new(()),
            checkpoints: AtomicU64::new(0),
        }
    }
}

impl HeapAreaStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from a previously exported image.
    pub(crate) fn from_parts(
        areas: HashMap<u64, Vec<u8>>,
        next_id: u64,
        root: Option<AreaId>,
    ) -> Self {
        Self {
            areas: RwLock::new(areas),
            next_id: AtomicU64::new(next_id),
            root: RwLock::new(root),
            ..Self::default()
        }
    }

    /// Exports `(areas sorted by id, next id, root)`.
    pub(crate) fn export(&self) -> (Vec<(u64, Vec<u8>)>, u64, Option<AreaId>) {
        let areas = self.areas.read();
        let mut out: Vec<(u64, Vec<u8>)> =
            areas.iter().map(|(id, data)| (*id, data.clone())).collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        (out, self.next_id.load(Ordering::SeqCst), *self.root.read())
    }

    /// Returns the number of live areas.
    ///
    /// Useful for leak checks in tests.
    #[must_use]
    pub fn area_count(&self) -> usize {
        self.areas.read().len()
    }

    /// Returns the total number of bytes held by live areas.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.areas.read().values().map(Vec::len).sum()
    }

    /// Returns how many checkpoints were requested.
    #[must_use]
    pub fn checkpoint_count(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Returns whether an area with this id exists.
    #[must_use]
    pub fn contains(&self, id: AreaId) -> bool {
        self.areas.read().contains_key(&id.0)
    }
}

fn check_range(id: AreaId, offset: usize, len: usize, size: usize) -> StorageResult<()> {
    let end = offset.checked_add(len);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(StorageError::OutOfBounds {
            id: id.0,
            offset,
            len,
            size,
        }),
    }
}

impl AreaStore for HeapAreaStore {
    fn create_area(&self, size: usize) -> StorageResult<AreaId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.areas.write().insert(id, vec![0u8; size]);
        Ok(AreaId(id))
    }

    fn area_size(&self, id: AreaId) -> StorageResult<usize> {
        self.areas
            .read()
            .get(&id.0)
            .map(Vec::len)
            .ok_or(StorageError::AreaNotFound { id: id.0 })
    }

    fn read_at(&self, id: AreaId, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
        let areas = self.areas.read();
        let data = areas
            .get(&id.0)
            .ok_or(StorageError::AreaNotFound { id: id.0 })?;
        check_range(id, offset, len, data.len())?;
        Ok(data[offset..offset + len].to_vec())
    }

    fn read_area(&self, id: AreaId) -> StorageResult<Bytes> {
        let areas = self.areas.read();
        let data = areas
            .get(&id.0)
            .ok_or(StorageError::AreaNotFound { id: id.0 })?;
        Ok(Bytes::copy_from_slice(data))
    }

    fn write_at(&self, id: AreaId, offset: usize, data: &[u8]) -> StorageResult<()> {
        let mut areas = self.areas.write();
        let area = areas
            .get_mut(&id.0)
            .ok_or(StorageError::AreaNotFound { id: id.0 })?;
        check_range(id, offset, data.len(), area.len())?;
        area[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn delete_area(&self, id: AreaId) -> StorageResult<()> {
        let removed = self.areas.write().remove(&id.0);
        if removed.is_none() {
            return Err(StorageError::AreaNotFound { id: id.0 });
        }
        let mut root = self.root.write();
        if *root == Some(id) {
            *root = None;
        }
        Ok(())
    }

    fn lock_for_write(&self) -> WriteLock<'_> {
        WriteLock::new(self.write_lock.lock())
    }

    fn checkpoint(&self) -> StorageResult<()> {
        // Nothing to persist
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn root_area(&self) -> Option<AreaId> {
        *self.root.read()
    }

    fn set_root_area(&self, id: Option<AreaId>) -> StorageResult<()> {
        if let Some(id) = id {
            if !self.contains(id) {
                return Err(StorageError::AreaNotFound { id: id.0 });
            }
        }
        *self.root.write() = id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_new_is_empty() {
        let store = HeapAreaStore::new();
        assert_eq!(store.area_count(), 0);
        assert_eq!(store.root_area(), None);
    }

    #[test]
    fn heap_create_is_zero_filled() {
        let store = HeapAreaStore::new();
        let id = store.create_area(8).unwrap();
        assert_eq!(store.read_at(id, 0, 8).unwrap(), vec![0u8; 8]);
        assert_eq!(store.area_size(id).unwrap(), 8);
    }

    #[test]
    fn heap_ids_are_not_reused() {
        let store = HeapAreaStore::new();
        let a = store.create_area(1).unwrap();
        store.delete_area(a).unwrap();
        let b = store.create_area(1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn heap_write_then_read() {
        let store = HeapAreaStore::new();
        let id = store.create_area(11).unwrap();
        store.write_at(id, 0, b"hello").unwrap();
        store.write_at(id, 5, b" world").unwrap();
        assert_eq!(&store.read_area(id).unwrap()[..], b"hello world");
    }

    #[test]
    fn heap_write_past_end_fails() {
        let store = HeapAreaStore::new();
        let id = store.create_area(4).unwrap();
        let result = store.write_at(id, 2, b"abc");
        assert!(matches!(result, Err(StorageError::OutOfBounds { .. })));
    }

    #[test]
    fn heap_read_deleted_area_fails() {
        let store = HeapAreaStore::new();
        let id = store.create_area_with(b"gone").unwrap();
        store.delete_area(id).unwrap();
        assert!(matches!(
            store.read_area(id),
            Err(StorageError::AreaNotFound { .. })
        ));
        assert!(store.delete_area(id).is_err());
    }

    #[test]
    fn heap_root_must_exist() {
        let store = HeapAreaStore::new();
        assert!(store.set_root_area(Some(AreaId::new(99))).is_err());

        let id = store.create_area(1).unwrap();
        store.set_root_area(Some(id)).unwrap();
        assert_eq!(store.root_area(), Some(id));

        store.delete_area(id).unwrap();
        assert_eq!(store.root_area(), None);
    }

    #[test]
    fn heap_write_lock_is_reentrant() {
        let store = HeapAreaStore::new();
        let _outer = store.lock_for_write();
        let _inner = store.lock_for_write();
        store.create_area(1).unwrap();
    }

    #[test]
    fn heap_checkpoint_counts() {
        let store = HeapAreaStore::new();
        store.checkpoint().unwrap();
        store.checkpoint().unwrap();
        assert_eq!(store.checkpoint_count(), 2);
    }

    proptest::proptest! {
        #[test]
        fn heap_writes_match_model(
            size in 1usize..256,
            writes in proptest::collection::vec((0usize..256, proptest::collection::vec(proptest::num::u8::ANY, 0..32)), 0..20),
        ) {
            let store = HeapAreaStore::new();
            let id = store.create_area(size).unwrap();
            let mut model = vec![0u8; size];
            for (offset, data) in writes {
                let result = store.write_at(id, offset, &data);
                if offset + data.len() <= size {
                    proptest::prop_assert!(result.is_ok());
                    model[offset..offset + data.len()].copy_from_slice(&data);
                } else {
                    proptest::prop_assert!(result.is_err());
                }
            }
            proptest::prop_assert_eq!(store.read_area(id).unwrap().to_vec(), model);
        }
    }
}

//! Area store trait definition.

use crate::error::{StorageError, StorageResult};
use bytes::Bytes;
use parking_lot::ReentrantMutexGuard;
use std::fmt;

/// Opaque handle of an area inside an [`AreaStore`].
///
/// Handles are never reused by a store for the lifetime of its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AreaId(pub u64);

impl AreaId {
    /// Creates an area id from its raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Encodes an optional area pointer the way on-disk structures store it
    /// (`-1` for "no area").
    #[must_use]
    pub fn to_pointer(id: Option<AreaId>) -> i64 {
        id.map_or(-1, |a| a.0 as i64)
    }

    /// Decodes a pointer written by [`AreaId::to_pointer`].
    #[must_use]
    pub fn from_pointer(raw: i64) -> Option<AreaId> {
        if raw < 0 {
            None
        } else {
            Some(AreaId(raw as u64))
        }
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "area:{}", self.0)
    }
}

/// Scoped exclusive write lock over a store.
///
/// The lock is re-entrant: a thread already holding it may acquire it
/// again. It is released when the guard is dropped, including while
/// unwinding.
#[must_use = "the store is unlocked as soon as the guard is dropped"]
pub struct WriteLock<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl<'a> WriteLock<'a> {
    /// Wraps a held re-entrant guard.
    pub fn new(guard: ReentrantMutexGuard<'a, ()>) -> Self {
        Self { _guard: guard }
    }
}

impl fmt::Debug for WriteLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteLock")
    }
}

/// A byte-addressable store of variably-sized areas.
///
/// # Invariants
///
/// - `create_area` returns a zero-filled area of exactly the requested size
/// - `read_at` returns exactly the bytes previously written at that offset
/// - Areas never grow; callers allocate a new area and delete the old one
/// - `checkpoint` makes every write performed so far durable
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::HeapAreaStore`] - For testing
/// - [`super::FileAreaStore`] - For persistent storage
pub trait AreaStore: Send + Sync {
    /// Allocates a zero-filled area of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot allocate.
    fn create_area(&self, size: usize) -> StorageResult<AreaId>;

    /// Returns the size of an area in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AreaNotFound`] for unknown ids.
    fn area_size(&self, id: AreaId) -> StorageResult<usize>;

    /// Reads `len` bytes of an area starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the area doesn't exist or the range exceeds it.
    fn read_at(&self, id: AreaId, offset: usize, len: usize) -> StorageResult<Vec<u8>>;

    /// Reads the whole content of an area.
    ///
    /// # Errors
    ///
    /// Returns an error if the area doesn't exist.
    fn read_area(&self, id: AreaId) -> StorageResult<Bytes>;

    /// Overwrites bytes of an area starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the area doesn't exist or the range exceeds it.
    fn write_at(&self, id: AreaId, offset: usize, data: &[u8]) -> StorageResult<()>;

    /// Deletes an area. Its id becomes invalid.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AreaNotFound`] for unknown ids.
    fn delete_area(&self, id: AreaId) -> StorageResult<()>;

    /// Acquires the store's exclusive write lock.
    fn lock_for_write(&self) -> WriteLock<'_>;

    /// Makes all writes so far durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be persisted.
    fn checkpoint(&self) -> StorageResult<()>;

    /// Returns the root area pointer, if one was set.
    fn root_area(&self) -> Option<AreaId>;

    /// Sets (or clears) the root area pointer.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` does not name an existing area.
    fn set_root_area(&self, id: Option<AreaId>) -> StorageResult<()>;

    /// Allocates an area holding exactly `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation or the write fails.
    fn create_area_with(&self, data: &[u8]) -> StorageResult<AreaId> {
        let id = self.create_area(data.len())?;
        self.write_at(id, 0, data)?;
        Ok(id)
    }
}

/// A positioned reader/writer over one area.
///
/// All integers are big-endian, matching the persisted layouts of the
/// table engine.
pub struct MutableArea<'a> {
    store: &'a dyn AreaStore,
    id: AreaId,
    size: usize,
    position: usize,
}

impl<'a> MutableArea<'a> {
    /// Opens an area for positioned access.
    ///
    /// # Errors
    ///
    /// Returns an error if the area doesn't exist.
    pub fn open(store: &'a dyn AreaStore, id: AreaId) -> StorageResult<Self> {
        let size = store.area_size(id)?;
        Ok(Self {
            store,
            id,
            size,
            position: 0,
        })
    }

    /// The id of the underlying area.
    #[must_use]
    pub fn id(&self) -> AreaId {
        self.id
    }

    /// The size of the underlying area.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current cursor position.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if `position` is past the end of the area.
    pub fn set_position(&mut self, position: usize) -> StorageResult<()> {
        if position > self.size {
            return Err(StorageError::OutOfBounds {
                id: self.id.0,
                offset: position,
                len: 0,
                size: self.size,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Reads `len` bytes at the cursor and advances it.
    ///
    /// # Errors
    ///
    /// Returns an error if the read exceeds the area.
    pub fn get_bytes(&mut self, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.store.read_at(self.id, self.position, len)?;
        self.position += len;
        Ok(data)
    }

    /// Reads a big-endian `i32` at the cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the read exceeds the area.
    pub fn get_i32(&mut self) -> StorageResult<i32> {
        let b = self.get_bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a big-endian `i64` at the cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the read exceeds the area.
    pub fn get_i64(&mut self) -> StorageResult<i64> {
        let b = self.get_bytes(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Writes bytes at the cursor and advances it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write exceeds the area.
    pub fn put_bytes(&mut self, data: &[u8]) -> StorageResult<()> {
        self.store.write_at(self.id, self.position, data)?;
        self.position += data.len();
        Ok(())
    }

    /// Writes a big-endian `i32` at the cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the write exceeds the area.
    pub fn put_i32(&mut self, value: i32) -> StorageResult<()> {
        self.put_bytes(&value.to_be_bytes())
    }

    /// Writes a big-endian `i64` at the cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the write exceeds the area.
    pub fn put_i64(&mut self, value: i64) -> StorageResult<()> {
        self.put_bytes(&value.to_be_bytes())
    }
}

impl fmt::Debug for MutableArea<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableArea")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapAreaStore;

    #[test]
    fn pointer_encoding() {
        assert_eq!(AreaId::to_pointer(None), -1);
        assert_eq!(AreaId::to_pointer(Some(AreaId::new(7))), 7);
        assert_eq!(AreaId::from_pointer(-1), None);
        assert_eq!(AreaId::from_pointer(7), Some(AreaId::new(7)));
    }

    #[test]
    fn mutable_area_cursor() {
        let store = HeapAreaStore::new();
        let id = store.create_area(12).unwrap();

        let mut area = MutableArea::open(&store, id).unwrap();
        area.put_i32(-5).unwrap();
        area.put_i64(1 << 40).unwrap();
        assert_eq!(area.position(), 12);

        area.set_position(0).unwrap();
        assert_eq!(area.get_i32().unwrap(), -5);
        assert_eq!(area.get_i64().unwrap(), 1 << 40);
    }

    #[test]
    fn mutable_area_rejects_overrun() {
        let store = HeapAreaStore::new();
        let id = store.create_area(4).unwrap();

        let mut area = MutableArea::open(&store, id).unwrap();
        assert!(area.put_i64(1).is_err());
        assert!(area.set_position(5).is_err());
    }

    #[test]
    fn big_endian_layout() {
        let store = HeapAreaStore::new();
        let id = store.create_area(4).unwrap();
        MutableArea::open(&store, id).unwrap().put_i32(0x0102_0304).unwrap();
        assert_eq!(store.read_at(id, 0, 4).unwrap(), vec![1, 2, 3, 4]);
    }
}

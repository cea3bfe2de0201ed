//! Large-object store collaborator.
//!
//! Rows hold [`BlobRef`]s; the bytes live in a [`BlobStore`]. The master
//! table establishes one reference per blob cell when a row is written and
//! releases it when the row is reclaimed.

use crate::error::{CoreError, CoreResult};
use crate::value::BlobRef;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reference-counted store of large objects.
pub trait BlobStore: Send + Sync {
    /// Adds one reference to `blob`.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob doesn't exist.
    fn establish_reference(&self, blob: BlobRef) -> CoreResult<()>;

    /// Removes one reference from `blob`.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob doesn't exist or has no references.
    fn release_reference(&self, blob: BlobRef) -> CoreResult<()>;
}

#[derive(Debug)]
struct BlobEntry {
    data: Vec<u8>,
    refs: u64,
}

/// In-memory [`BlobStore`].
///
/// A blob that was referenced and whose count falls back to zero is
/// removed. Blobs that were never referenced stay until referenced.
#[derive(Debug)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<u64, BlobEntry>>,
    next_id: AtomicU64,
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` and returns an unreferenced handle to it.
    pub fn put(&self, data: impl Into<Vec<u8>>) -> BlobRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.blobs.lock().insert(
            id,
            BlobEntry {
                data: data.into(),
                refs: 0,
            },
        );
        BlobRef::new(id)
    }

    /// Returns a copy of the blob's bytes.
    #[must_use]
    pub fn get(&self, blob: BlobRef) -> Option<Vec<u8>> {
        self.blobs.lock().get(&blob.id).map(|e| e.data.clone())
    }

    /// Current reference count, 0 for unknown blobs.
    #[must_use]
    pub fn ref_count(&self, blob: BlobRef) -> u64 {
        self.blobs.lock().get(&blob.id).map_or(0, |e| e.refs)
    }

    /// Number of blobs held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn establish_reference(&self, blob: BlobRef) -> CoreResult<()> {
        let mut blobs = self.blobs.lock();
        let entry = blobs
            .get_mut(&blob.id)
            .ok_or_else(|| CoreError::invalid_operation(format!("unknown blob {}", blob.id)))?;
        entry.refs += 1;
        Ok(())
    }

    fn release_reference(&self, blob: BlobRef) -> CoreResult<()> {
        let mut blobs = self.blobs.lock();
        let entry = blobs
            .get_mut(&blob.id)
            .ok_or_else(|| CoreError::invalid_operation(format!("unknown blob {}", blob.id)))?;
        if entry.refs == 0 {
            return Err(CoreError::invalid_operation(format!(
                "blob {} has no references",
                blob.id
            )));
        }
        entry.refs -= 1;
        if entry.refs == 0 {
            blobs.remove(&blob.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_counting() {
        let store = InMemoryBlobStore::new();
        let blob = store.put(b"large".to_vec());
        assert_eq!(store.ref_count(blob), 0);

        store.establish_reference(blob).unwrap();
        store.establish_reference(blob).unwrap();
        assert_eq!(store.ref_count(blob), 2);

        store.release_reference(blob).unwrap();
        assert_eq!(store.get(blob).as_deref(), Some(&b"large"[..]));

        store.release_reference(blob).unwrap();
        assert!(store.get(blob).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn release_without_reference_fails() {
        let store = InMemoryBlobStore::new();
        let blob = store.put(vec![1, 2, 3]);
        assert!(store.release_reference(blob).is_err());
        assert!(store.establish_reference(BlobRef::new(999)).is_err());
    }
}

//! File-backed area store.

use crate::area::{AreaId, AreaStore, WriteLock};
use crate::error::{StorageError, StorageResult};
use crate::heap::HeapAreaStore;
use bytes::{Buf, BufMut, Bytes};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes at the start of a store image: "TBLA".
const IMAGE_MAGIC: [u8; 4] = *b"TBLA";

/// Current image format version.
const IMAGE_VERSION: u16 = 1;

/// magic (4) + version (2) + reserved (2) + next_id (8) + root (8) + count (8)
const IMAGE_HEADER_SIZE: usize = 32;

/// A file-backed area store.
///
/// Areas live in memory while the store is open. `checkpoint()` writes a
/// complete image of the store to a temporary file, syncs it and renames it
/// over the previous image, so a crash leaves either the old or the new
/// image on disk, never a torn one.
///
/// # Image Format
///
/// ```text
/// | magic "TBLA" (4) | version (2) | reserved (2) | next_id (8) | root (8) | count (8) |
/// | { area_id (8) | len (4) | bytes (len) } * count |
/// | crc32 (4) |
/// ```
///
/// All integers are big-endian. The CRC covers everything before it.
///
/// # Locking
///
/// An exclusive advisory lock is taken on `<path>.lock` for as long as the
/// store is open, so two processes cannot open the same image.
///
/// # Example
///
/// ```no_run
/// use tabula_storage::{AreaStore, FileAreaStore};
/// use std::path::Path;
///
/// let store = FileAreaStore::open(Path::new("tables.db")).unwrap();
/// let id = store.create_area_with(b"persistent").unwrap();
/// store.set_root_area(Some(id)).unwrap();
/// store.checkpoint().unwrap();
/// ```
#[derive(Debug)]
pub struct FileAreaStore {
    path: PathBuf,
    heap: HeapAreaStore,
    lock_file: File,
    image_lock: Mutex<()>,
}

impl FileAreaStore {
    /// Opens the image at `path`, creating an empty store if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process has the store
    /// open, and [`StorageError::Corrupted`] if the image fails validation.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(path))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;

        let heap = if path.exists() {
            let mut data = Vec::new();
            File::open(path)?.read_to_end(&mut data)?;
            if data.is_empty() {
                HeapAreaStore::new()
            } else {
                decode_image(&data)?
            }
        } else {
            HeapAreaStore::new()
        };

        tracing::debug!(path = %path.display(), areas = heap.area_count(), "opened area store");

        Ok(Self {
            path: path.to_path_buf(),
            heap,
            lock_file,
            image_lock: Mutex::new(()),
        })
    }

    /// Returns the path of the image file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of live areas.
    #[must_use]
    pub fn area_count(&self) -> usize {
        self.heap.area_count()
    }

    fn write_image(&self) -> StorageResult<()> {
        let _image = self.image_lock.lock();
        let (areas, next_id, root) = self.heap.export();
        let image = encode_image(&areas, next_id, root);

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&image)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Drop for FileAreaStore {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.lock_file) {
            tracing::warn!(error = %err, "failed to release store lock");
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn encode_image(areas: &[(u64, Vec<u8>)], next_id: u64, root: Option<AreaId>) -> Vec<u8> {
    let body: usize = areas.iter().map(|(_, d)| 12 + d.len()).sum();
    let mut buf = Vec::with_capacity(IMAGE_HEADER_SIZE + body + 4);

    buf.put_slice(&IMAGE_MAGIC);
    buf.put_u16(IMAGE_VERSION);
    buf.put_u16(0);
    buf.put_u64(next_id);
    buf.put_i64(AreaId::to_pointer(root));
    buf.put_u64(areas.len() as u64);

    for (id, data) in areas {
        buf.put_u64(*id);
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    let crc = crc32fast::hash(&buf);
    buf.put_u32(crc);
    buf
}

fn decode_image(data: &[u8]) -> StorageResult<HeapAreaStore> {
    if data.len() < IMAGE_HEADER_SIZE + 4 {
        return Err(StorageError::Corrupted("image too short".into()));
    }

    let (body, trailer) = data.split_at(data.len() - 4);
    let stored_crc = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed_crc = crc32fast::hash(body);
    if stored_crc != computed_crc {
        return Err(StorageError::Corrupted(format!(
            "checksum mismatch: expected {stored_crc:08x}, got {computed_crc:08x}"
        )));
    }

    let mut buf = Bytes::copy_from_slice(body);
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != IMAGE_MAGIC {
        return Err(StorageError::Corrupted("invalid image magic".into()));
    }
    let version = buf.get_u16();
    if version != IMAGE_VERSION {
        return Err(StorageError::Corrupted(format!(
            "unsupported image version: {version}"
        )));
    }
    let _reserved = buf.get_u16();
    let next_id = buf.get_u64();
    let root = AreaId::from_pointer(buf.get_i64());
    let count = buf.get_u64();

    let mut areas = HashMap::new();
    for _ in 0..count {
        if buf.remaining() < 12 {
            return Err(StorageError::Corrupted("truncated area entry".into()));
        }
        let id = buf.get_u64();
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(StorageError::Corrupted(format!(
                "area {id} extends beyond image"
            )));
        }
        let bytes = buf.copy_to_bytes(len).to_vec();
        if id >= next_id {
            return Err(StorageError::Corrupted(format!(
                "area {id} is not below next id {next_id}"
            )));
        }
        areas.insert(id, bytes);
    }

    if let Some(root) = root {
        if !areas.contains_key(&root.0) {
            return Err(StorageError::Corrupted(format!("root {root} missing")));
        }
    }

    Ok(HeapAreaStore::from_parts(areas, next_id, root))
}

impl AreaStore for FileAreaStore {
    fn create_area(&self, size: usize) -> StorageResult<AreaId> {
        self.heap.create_area(size)
    }

    fn area_size(&self, id: AreaId) -> StorageResult<usize> {
        self.heap.area_size(id)
    }

    fn read_at(&self, id: AreaId, offset: usize, len: usize) -> StorageResult<Vec<u8>> {
        self.heap.read_at(id, offset, len)
    }

    fn read_area(&self, id: AreaId) -> StorageResult<Bytes> {
        self.heap.read_area(id)
    }

    fn write_at(&self, id: AreaId, offset: usize, data: &[u8]) -> StorageResult<()> {
        self.heap.write_at(id, offset, data)
    }

    fn delete_area(&self, id: AreaId) -> StorageResult<()> {
        self.heap.delete_area(id)
    }

    fn lock_for_write(&self) -> WriteLock<'_> {
        self.heap.lock_for_write()
    }

    fn checkpoint(&self) -> StorageResult<()> {
        // Hold the write lock so the image is a consistent cut
        let _lock = self.lock_for_write();
        self.write_image()?;
        self.heap.checkpoint()
    }

    fn root_area(&self) -> Option<AreaId> {
        self.heap.root_area()
    }

    fn set_root_area(&self, id: Option<AreaId>) -> StorageResult<()> {
        self.heap.set_root_area(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        let store = FileAreaStore::open(&path).unwrap();
        assert_eq!(store.area_count(), 0);
        assert_eq!(store.path(), path);
    }

    #[test]
    fn file_persistence_after_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        let id = {
            let store = FileAreaStore::open(&path).unwrap();
            let id = store.create_area_with(b"persistent data").unwrap();
            store.set_root_area(Some(id)).unwrap();
            store.checkpoint().unwrap();
            id
        };

        let store = FileAreaStore::open(&path).unwrap();
        assert_eq!(store.root_area(), Some(id));
        assert_eq!(&store.read_area(id).unwrap()[..], b"persistent data");
        // Fresh ids continue past the persisted ones
        assert!(store.create_area(1).unwrap() > id);
    }

    #[test]
    fn file_unflushed_writes_are_lost() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = FileAreaStore::open(&path).unwrap();
            store.create_area_with(b"checkpointed").unwrap();
            store.checkpoint().unwrap();
            store.create_area_with(b"not checkpointed").unwrap();
        }

        let store = FileAreaStore::open(&path).unwrap();
        assert_eq!(store.area_count(), 1);
    }

    #[test]
    fn file_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = FileAreaStore::open(&path).unwrap();
            store.create_area_with(b"some bytes").unwrap();
            store.checkpoint().unwrap();
        }

        let mut data = fs::read(&path).unwrap();
        data[IMAGE_HEADER_SIZE + 14] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let result = FileAreaStore::open(&path);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        let _first = FileAreaStore::open(&path).unwrap();
        let second = FileAreaStore::open(&path);
        assert!(matches!(second, Err(StorageError::Locked)));
    }

    #[test]
    fn file_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");

        let store = FileAreaStore::open(&path).unwrap();
        store.checkpoint().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn image_roundtrip_preserves_layout() {
        let areas = vec![(1, b"ab".to_vec()), (4, Vec::new())];
        let image = encode_image(&areas, 5, Some(AreaId::new(1)));
        let heap = decode_image(&image).unwrap();
        let (decoded, next_id, root) = heap.export();
        assert_eq!(decoded, areas);
        assert_eq!(next_id, 5);
        assert_eq!(root, Some(AreaId::new(1)));
    }
}

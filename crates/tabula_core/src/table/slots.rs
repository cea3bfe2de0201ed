//! Fixed-size row slot list with an intrusive free chain.
//!
//! ## Layout
//!
//! ```text
//! slot header | slot count (4) | first free (8) | block count (4) | block ptr (8) * 26 |
//! slot block  | { status (4) | pointer (8) } * (64 << k)    for block k
//! ```
//!
//! A free slot carries [`DELETED_FLAG`] in its status and the index of the
//! next free slot (or -1) in its pointer. An occupied slot carries its row
//! status bits and the area of its record. The list only grows when the
//! free chain is empty.

use crate::error::{CoreError, CoreResult};
use crate::types::RowId;
use bytes::{Buf, BufMut};
use tabula_storage::{AreaId, AreaStore};

/// Status bit of a free slot.
pub const DELETED_FLAG: i32 = 0x0002_0000;

const COMMIT_TYPE_MASK: i32 = 0xF0;
const RECORD_SIZE: usize = 12;
const FIRST_BLOCK_RECORDS: usize = 64;
const MAX_BLOCKS: usize = 26;
const HEADER_SIZE: usize = 4 + 8 + 4 + MAX_BLOCKS * 8;

/// Commit state of an occupied row slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowStatus {
    /// Written by a transaction that has not committed.
    Uncommitted,
    /// Added by a committed transaction.
    CommittedAdded,
    /// Removed by a committed transaction, or abandoned by a rollback.
    CommittedRemoved,
}

impl RowStatus {
    /// The persisted commit type bits.
    #[must_use]
    pub const fn bits(self) -> i32 {
        match self {
            Self::Uncommitted => 0x00,
            Self::CommittedAdded => 0x10,
            Self::CommittedRemoved => 0x20,
        }
    }

    fn from_bits(bits: i32) -> CoreResult<Self> {
        match bits & COMMIT_TYPE_MASK {
            0x00 => Ok(Self::Uncommitted),
            0x10 => Ok(Self::CommittedAdded),
            0x20 => Ok(Self::CommittedRemoved),
            other => Err(CoreError::corruption(format!(
                "unknown row commit type {other:#x}"
            ))),
        }
    }
}

/// One entry of the slot list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Reusable slot, linked to the next free one.
    Free {
        /// Next slot of the free chain.
        next: Option<RowId>,
    },
    /// Slot holding a row record.
    Occupied {
        /// Commit state.
        status: RowStatus,
        /// Record area.
        data: AreaId,
    },
}

/// Persisted slot list of one table, mirrored in memory.
#[derive(Debug)]
pub struct SlotList {
    header_area: AreaId,
    blocks: Vec<AreaId>,
    slots: Vec<Slot>,
    first_free: Option<RowId>,
}

fn block_records(k: usize) -> usize {
    FIRST_BLOCK_RECORDS << k
}

/// `(block, index within block)` of slot `index`.
fn locate(index: usize) -> (usize, usize) {
    let mut base = 0;
    let mut k = 0;
    loop {
        let cap = block_records(k);
        if index < base + cap {
            return (k, index - base);
        }
        base += cap;
        k += 1;
    }
}

fn row_pointer(row: Option<RowId>) -> i64 {
    row.map_or(-1, |r| i64::from(r.as_u32()))
}

fn pointer_row(raw: i64) -> Option<RowId> {
    u32::try_from(raw).ok().map(RowId::new)
}

impl SlotList {
    /// Allocates an empty slot list.
    ///
    /// # Errors
    ///
    /// Returns an error if the area store fails.
    pub fn create(store: &dyn AreaStore) -> CoreResult<Self> {
        let header_area = store.create_area(HEADER_SIZE)?;
        let list = Self {
            header_area,
            blocks: Vec::new(),
            slots: Vec::new(),
            first_free: None,
        };
        list.write_header(store)?;
        Ok(list)
    }

    /// Loads the slot list whose header is `header_area`.
    ///
    /// # Errors
    ///
    /// Returns `Corruption` if the header or any slot is malformed.
    pub fn open(store: &dyn AreaStore, header_area: AreaId) -> CoreResult<Self> {
        let header = store.read_area(header_area)?;
        if header.len() < HEADER_SIZE {
            return Err(CoreError::corruption("slot header truncated"));
        }
        let mut buf = &header[..];
        let slot_count = buf.get_i32();
        let first_free = pointer_row(buf.get_i64());
        let block_count = buf.get_i32();
        if slot_count < 0 || block_count < 0 || block_count as usize > MAX_BLOCKS {
            return Err(CoreError::corruption(format!(
                "slot header declares {slot_count} slots in {block_count} blocks"
            )));
        }
        let mut blocks = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            let area = AreaId::from_pointer(buf.get_i64())
                .ok_or_else(|| CoreError::corruption("null slot block pointer"))?;
            blocks.push(area);
        }
        let capacity: usize = (0..blocks.len()).map(block_records).sum();
        if slot_count as usize > capacity {
            return Err(CoreError::corruption(format!(
                "{slot_count} slots exceed block capacity {capacity}"
            )));
        }

        let mut slots = Vec::with_capacity(slot_count as usize);
        let mut index = 0usize;
        for (k, area) in blocks.iter().enumerate() {
            if index >= slot_count as usize {
                break;
            }
            let data = store.read_area(*area)?;
            if data.len() < block_records(k) * RECORD_SIZE {
                return Err(CoreError::corruption(format!("slot block {k} truncated")));
            }
            let mut records = &data[..];
            for _ in 0..block_records(k) {
                if index >= slot_count as usize {
                    break;
                }
                let status = records.get_i32();
                let pointer = records.get_i64();
                let slot = if status & DELETED_FLAG != 0 {
                    Slot::Free {
                        next: pointer_row(pointer),
                    }
                } else {
                    Slot::Occupied {
                        status: RowStatus::from_bits(status)?,
                        data: AreaId::from_pointer(pointer).ok_or_else(|| {
                            CoreError::corruption(format!("row {index} has no record"))
                        })?,
                    }
                };
                slots.push(slot);
                index += 1;
            }
        }

        Ok(Self {
            header_area,
            blocks,
            slots,
            first_free,
        })
    }

    /// The slot header area.
    #[must_use]
    pub fn header_area(&self) -> AreaId {
        self.header_area
    }

    /// Number of slots ever allocated.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot was ever allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Head of the free chain.
    #[must_use]
    pub fn first_free(&self) -> Option<RowId> {
        self.first_free
    }

    /// Number of free slots.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Free { .. }))
            .count()
    }

    /// Slot of `row`.
    #[must_use]
    pub fn get(&self, row: RowId) -> Option<Slot> {
        self.slots.get(row.index()).copied()
    }

    fn occupied(&self, row: RowId) -> CoreResult<(RowStatus, AreaId)> {
        match self.slots.get(row.index()) {
            Some(Slot::Occupied { status, data }) => Ok((*status, *data)),
            Some(Slot::Free { .. }) => Err(CoreError::invalid_operation(format!(
                "{row} refers to a deleted slot"
            ))),
            None => Err(CoreError::invalid_operation(format!(
                "{row} is beyond the slot list ({} slots)",
                self.slots.len()
            ))),
        }
    }

    /// Commit state of `row`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the slot is free or out of range.
    pub fn status(&self, row: RowId) -> CoreResult<RowStatus> {
        self.occupied(row).map(|(s, _)| s)
    }

    /// Record area of `row`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the slot is free or out of range.
    pub fn data_area(&self, row: RowId) -> CoreResult<AreaId> {
        self.occupied(row).map(|(_, d)| d)
    }

    /// Occupied slots with their status and record area.
    pub fn rows(&self) -> impl Iterator<Item = (RowId, RowStatus, AreaId)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied { status, data } => Some((RowId::new(i as u32), *status, *data)),
            Slot::Free { .. } => None,
        })
    }

    /// Stores an uncommitted row pointing at `data`, reusing a free slot
    /// when one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the area store fails or the list is full.
    pub fn allocate(&mut self, store: &dyn AreaStore, data: AreaId) -> CoreResult<RowId> {
        let row = match self.first_free {
            Some(row) => {
                let next = match self.slots.get(row.index()) {
                    Some(Slot::Free { next }) => *next,
                    _ => {
                        return Err(CoreError::corruption(format!(
                            "free chain points at occupied {row}"
                        )))
                    }
                };
                self.first_free = next;
                row
            }
            None => {
                let index = self.slots.len();
                let (k, _) = locate(index);
                if k >= self.blocks.len() {
                    if k >= MAX_BLOCKS {
                        return Err(CoreError::invalid_operation("slot list is full"));
                    }
                    let area = store.create_area(block_records(k) * RECORD_SIZE)?;
                    self.blocks.push(area);
                }
                self.slots.push(Slot::Free { next: None });
                RowId::new(index as u32)
            }
        };

        let status = RowStatus::Uncommitted;
        self.slots[row.index()] = Slot::Occupied { status, data };
        self.write_record(store, row, status.bits(), AreaId::to_pointer(Some(data)))?;
        self.write_header(store)?;
        Ok(row)
    }

    /// Rewrites the status bits of `row`, keeping its record pointer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the slot is free.
    pub fn set_status(
        &mut self,
        store: &dyn AreaStore,
        row: RowId,
        status: RowStatus,
    ) -> CoreResult<()> {
        let (_, data) = self.occupied(row)?;
        let (k, i) = locate(row.index());
        store.write_at(self.blocks[k], i * RECORD_SIZE, &status.bits().to_be_bytes())?;
        self.slots[row.index()] = Slot::Occupied { status, data };
        Ok(())
    }

    /// Pushes `row` onto the free chain and returns its former record area.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the slot is already free.
    pub fn free(&mut self, store: &dyn AreaStore, row: RowId) -> CoreResult<AreaId> {
        let (_, data) = self.occupied(row)?;
        let next = self.first_free;
        self.slots[row.index()] = Slot::Free { next };
        self.first_free = Some(row);
        self.write_record(store, row, DELETED_FLAG, row_pointer(next))?;
        self.write_header(store)?;
        Ok(data)
    }

    /// Walks the free chain.
    ///
    /// # Errors
    ///
    /// Returns `Corruption` if the chain leaves the list, reaches an
    /// occupied slot or loops.
    pub fn free_chain(&self) -> CoreResult<Vec<RowId>> {
        let mut chain = Vec::new();
        let mut cursor = self.first_free;
        while let Some(row) = cursor {
            if chain.len() > self.slots.len() {
                return Err(CoreError::corruption("free chain loops"));
            }
            match self.slots.get(row.index()) {
                Some(Slot::Free { next }) => {
                    chain.push(row);
                    cursor = *next;
                }
                _ => {
                    return Err(CoreError::corruption(format!(
                        "free chain reaches {row}, which is not free"
                    )))
                }
            }
        }
        Ok(chain)
    }

    /// Relinks every free slot into a fresh chain, lowest index first.
    ///
    /// # Errors
    ///
    /// Returns an error if the area store fails.
    pub fn rebuild_free_chain(&mut self, store: &dyn AreaStore) -> CoreResult<usize> {
        let mut head = None;
        let mut count = 0;
        for index in (0..self.slots.len()).rev() {
            if let Slot::Free { .. } = self.slots[index] {
                let row = RowId::new(index as u32);
                self.slots[index] = Slot::Free { next: head };
                self.write_record(store, row, DELETED_FLAG, row_pointer(head))?;
                head = Some(row);
                count += 1;
            }
        }
        self.first_free = head;
        self.write_header(store)?;
        Ok(count)
    }

    /// Deletes every area of the list.
    ///
    /// # Errors
    ///
    /// Returns the first area store error; remaining areas are still
    /// attempted.
    pub fn drop_storage(&mut self, store: &dyn AreaStore) -> CoreResult<()> {
        self.slots.clear();
        self.first_free = None;
        let mut first_err = None;
        let blocks = std::mem::take(&mut self.blocks);
        for area in blocks.into_iter().chain(std::iter::once(self.header_area)) {
            if let Err(err) = store.delete_area(area) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn write_record(
        &self,
        store: &dyn AreaStore,
        row: RowId,
        status: i32,
        pointer: i64,
    ) -> CoreResult<()> {
        let (k, i) = locate(row.index());
        let mut record = Vec::with_capacity(RECORD_SIZE);
        record.put_i32(status);
        record.put_i64(pointer);
        store.write_at(self.blocks[k], i * RECORD_SIZE, &record)?;
        Ok(())
    }

    fn write_header(&self, store: &dyn AreaStore) -> CoreResult<()> {
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.put_i32(self.slots.len() as i32);
        header.put_i64(row_pointer(self.first_free));
        header.put_i32(self.blocks.len() as i32);
        for k in 0..MAX_BLOCKS {
            header.put_i64(AreaId::to_pointer(self.blocks.get(k).copied()));
        }
        store.write_at(self.header_area, 0, &header)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_storage::HeapAreaStore;

    fn data(store: &HeapAreaStore) -> AreaId {
        store.create_area(1).unwrap()
    }

    #[test]
    fn locate_doubles_blocks() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(63), (0, 63));
        assert_eq!(locate(64), (1, 0));
        assert_eq!(locate(191), (1, 127));
        assert_eq!(locate(192), (2, 0));
    }

    #[test]
    fn allocate_grows_only_when_chain_empty() {
        let store = HeapAreaStore::new();
        let mut slots = SlotList::create(&store).unwrap();

        let a = slots.allocate(&store, data(&store)).unwrap();
        let b = slots.allocate(&store, data(&store)).unwrap();
        assert_eq!((a, b), (RowId::new(0), RowId::new(1)));

        slots.free(&store, a).unwrap();
        assert_eq!(slots.free_count(), 1);
        let c = slots.allocate(&store, data(&store)).unwrap();
        assert_eq!(c, a);
        assert_eq!(slots.len(), 2);

        let d = slots.allocate(&store, data(&store)).unwrap();
        assert_eq!(d, RowId::new(2));
        assert_eq!(slots.len(), 3);
    }

    #[test]
    fn status_flip_keeps_pointer() {
        let store = HeapAreaStore::new();
        let mut slots = SlotList::create(&store).unwrap();
        let area = data(&store);
        let row = slots.allocate(&store, area).unwrap();
        assert_eq!(slots.status(row).unwrap(), RowStatus::Uncommitted);

        slots.set_status(&store, row, RowStatus::CommittedAdded).unwrap();
        assert_eq!(slots.status(row).unwrap(), RowStatus::CommittedAdded);
        assert_eq!(slots.data_area(row).unwrap(), area);

        let reopened = SlotList::open(&store, slots.header_area()).unwrap();
        assert_eq!(reopened.status(row).unwrap(), RowStatus::CommittedAdded);
        assert_eq!(reopened.data_area(row).unwrap(), area);
    }

    #[test]
    fn free_slot_reads_fail() {
        let store = HeapAreaStore::new();
        let mut slots = SlotList::create(&store).unwrap();
        let row = slots.allocate(&store, data(&store)).unwrap();
        slots.free(&store, row).unwrap();

        assert!(matches!(
            slots.status(row),
            Err(CoreError::InvalidOperation { .. })
        ));
        assert!(slots.free(&store, row).is_err());
        assert!(slots.status(RowId::new(10)).is_err());
    }

    #[test]
    fn persisted_across_blocks() {
        let store = HeapAreaStore::new();
        let mut slots = SlotList::create(&store).unwrap();
        for _ in 0..100 {
            slots.allocate(&store, data(&store)).unwrap();
        }
        slots.free(&store, RowId::new(70)).unwrap();
        slots.free(&store, RowId::new(3)).unwrap();

        let reopened = SlotList::open(&store, slots.header_area()).unwrap();
        assert_eq!(reopened.len(), 100);
        assert_eq!(
            reopened.free_chain().unwrap(),
            vec![RowId::new(3), RowId::new(70)]
        );
        assert_eq!(reopened.rows().count(), 98);
    }

    #[test]
    fn rebuild_chain_orders_by_index() {
        let store = HeapAreaStore::new();
        let mut slots = SlotList::create(&store).unwrap();
        for _ in 0..5 {
            slots.allocate(&store, data(&store)).unwrap();
        }
        for r in [1, 4, 2] {
            slots.free(&store, RowId::new(r)).unwrap();
        }
        assert_eq!(slots.rebuild_free_chain(&store).unwrap(), 3);
        assert_eq!(
            slots.free_chain().unwrap(),
            vec![RowId::new(1), RowId::new(2), RowId::new(4)]
        );
    }

    #[test]
    fn drop_storage_removes_areas() {
        let store = HeapAreaStore::new();
        let mut slots = SlotList::create(&store).unwrap();
        let area = data(&store);
        slots.allocate(&store, area).unwrap();
        slots.drop_storage(&store).unwrap();
        // Only the record area the test created remains
        assert_eq!(store.area_count(), 1);
        assert!(store.contains(area));
    }
}

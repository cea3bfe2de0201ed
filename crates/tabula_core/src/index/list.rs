//! Blocked, copy-on-write list of row ids.

use crate::error::CoreResult;
use std::cmp::Ordering;
use std::sync::Arc;
use tabula_storage::AreaId;

/// Where an unmodified list block is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    /// Element block area.
    pub area: AreaId,
    /// First element of the block.
    pub first: u32,
    /// Last element of the block.
    pub last: u32,
    /// Number of elements.
    pub count: usize,
    /// Bytes per element.
    pub width: u8,
}

/// One contiguous run of the list.
///
/// `stored` is `Some` while the elements equal what is persisted in the
/// descriptor's area; any mutation clears it so the block is rewritten on
/// commit.
#[derive(Debug, Clone)]
pub(crate) struct ListBlock {
    pub(crate) stored: Option<BlockDescriptor>,
    pub(crate) elements: Arc<Vec<u32>>,
}

impl ListBlock {
    fn fresh(elements: Vec<u32>) -> Self {
        Self {
            stored: None,
            elements: Arc::new(elements),
        }
    }

    fn elements_mut(&mut self) -> &mut Vec<u32> {
        self.stored = None;
        Arc::make_mut(&mut self.elements)
    }
}

/// An ordered list of row ids split into blocks.
///
/// Cloning a list is cheap: blocks are shared through `Arc` and copied on
/// first write, so a clone can be mutated without disturbing the list it
/// came from. Index sets rely on this to hand every transaction its own
/// working copy of a committed list.
///
/// Column index lists are not ordered by row id; callers that keep them
/// ordered by another key use [`IndexIntegerList::binary_search_by`] with
/// [`IndexIntegerList::insert_at`] and [`IndexIntegerList::remove_at`].
#[derive(Debug, Clone)]
pub struct IndexIntegerList {
    blocks: Vec<ListBlock>,
    block_size: usize,
    len: usize,
    modified: bool,
}

impl IndexIntegerList {
    /// Creates an empty list whose blocks split above `block_size` elements.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            block_size: block_size.max(2),
            len: 0,
            modified: false,
        }
    }

    pub(crate) fn from_blocks(blocks: Vec<ListBlock>, block_size: usize) -> Self {
        let len = blocks.iter().map(|b| b.elements.len()).sum();
        Self {
            blocks,
            block_size: block_size.max(2),
            len,
            modified: false,
        }
    }

    pub(crate) fn blocks(&self) -> &[ListBlock] {
        &self.blocks
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum elements per block.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the list changed since it was loaded.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Element at `pos`.
    #[must_use]
    pub fn get(&self, pos: usize) -> Option<u32> {
        if pos >= self.len {
            return None;
        }
        let (block, offset) = self.locate(pos);
        Some(self.blocks[block].elements[offset])
    }

    /// Iterates all elements in list order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.iter().flat_map(|b| b.elements.iter().copied())
    }

    /// Collects the elements.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }

    /// Removes every element.
    pub fn clear(&mut self) {
        if !self.blocks.is_empty() {
            self.modified = true;
        }
        self.blocks.clear();
        self.len = 0;
    }

    /// Maps a list position to `(block, offset)`. `pos == len` maps to the
    /// end of the last block.
    fn locate(&self, pos: usize) -> (usize, usize) {
        let mut start = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            let n = block.elements.len();
            if pos < start + n {
                return (i, pos - start);
            }
            start += n;
        }
        let last = self.blocks.len().saturating_sub(1);
        (last, pos - (start - self.blocks.get(last).map_or(0, |b| b.elements.len())))
    }

    /// Inserts `value` at `pos`, shifting later elements.
    ///
    /// # Panics
    ///
    /// Panics if `pos > len`.
    pub fn insert_at(&mut self, pos: usize, value: u32) {
        assert!(pos <= self.len, "insert position {pos} beyond length {}", self.len);
        self.modified = true;
        self.len += 1;

        if self.blocks.is_empty() {
            self.blocks.push(ListBlock::fresh(vec![value]));
            return;
        }

        let (block, offset) = self.locate(pos);
        let elements = self.blocks[block].elements_mut();
        elements.insert(offset, value);

        if elements.len() > self.block_size {
            let tail = elements.split_off(elements.len() / 2);
            self.blocks.insert(block + 1, ListBlock::fresh(tail));
        }
    }

    /// Removes and returns the element at `pos`.
    ///
    /// # Panics
    ///
    /// Panics if `pos >= len`.
    pub fn remove_at(&mut self, pos: usize) -> u32 {
        assert!(pos < self.len, "remove position {pos} beyond length {}", self.len);
        self.modified = true;
        self.len -= 1;

        let (block, offset) = self.locate(pos);
        let elements = self.blocks[block].elements_mut();
        let value = elements.remove(offset);
        if elements.is_empty() {
            self.blocks.remove(block);
        }
        value
    }

    /// Binary search over a list ordered by `cmp`.
    ///
    /// `cmp` returns how an element orders relative to the target. Returns
    /// `Ok(Ok(pos))` when an element compares equal and `Ok(Err(pos))` with
    /// the insertion point otherwise.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `cmp`.
    pub fn binary_search_by<F>(&self, mut cmp: F) -> CoreResult<Result<usize, usize>>
    where
        F: FnMut(u32) -> CoreResult<Ordering>,
    {
        // Find the first block whose last element is not below the target
        let (mut lo, mut hi) = (0, self.blocks.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let last = *self.blocks[mid]
                .elements
                .last()
                .unwrap_or(&0);
            if cmp(last)? == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let base: usize = self.blocks[..lo].iter().map(|b| b.elements.len()).sum();
        let Some(block) = self.blocks.get(lo) else {
            return Ok(Err(self.len));
        };

        let elements = &block.elements;
        let (mut lo, mut hi) = (0, elements.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match cmp(elements[mid])? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(base + mid)),
            }
        }
        Ok(Err(base + lo))
    }

    /// Position of `value` in a list sorted by row id.
    fn search(&self, value: u32) -> Result<usize, usize> {
        // Comparing plain integers cannot fail
        self.binary_search_by(|e| Ok(e.cmp(&value)))
            .unwrap_or(Err(self.len))
    }

    /// Whether `value` is in a list sorted by row id.
    #[must_use]
    pub fn contains(&self, value: u32) -> bool {
        self.search(value).is_ok()
    }

    /// Inserts `value` into a list sorted by row id, ignoring duplicates.
    /// Returns whether it was inserted.
    pub fn insert_sort(&mut self, value: u32) -> bool {
        match self.search(value) {
            Ok(_) => false,
            Err(pos) => {
                self.insert_at(pos, value);
                true
            }
        }
    }

    /// Removes `value` from a list sorted by row id. Returns whether it was
    /// present.
    pub fn remove_sort(&mut self, value: u32) -> bool {
        match self.search(value) {
            Ok(pos) => {
                self.remove_at(pos);
                true
            }
            Err(_) => false,
        }
    }
}

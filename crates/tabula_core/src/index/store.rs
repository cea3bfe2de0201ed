//! Versioned, copy-on-write storage of a table's index lists.
//!
//! ## Layout
//!
//! ```text
//! start header   | magic (4) | version (4) | index header ptr (8) |
//! index header   | count (4) | { type=1 (4) | block size (4) | IndexBlock ptr (8) } * count |
//! IndexBlock     | count (4) | { first (8) | last (8) | element block ptr (8) | count|width<<24 (4) } * count |
//! element block  | packed elements, see `compact` |
//! ```
//!
//! All integers are big-endian.
//!
//! ## Versions
//!
//! Every index number points at one [`IndexBlockNode`] in an arena. A node
//! is immutable once written. Committing a changed list writes a new node
//! whose `parent` is the node it replaces; the replaced node is marked
//! deleted and keeps the element areas the new node no longer uses.
//!
//! The store holds one reference on each current node and every snapshot
//! holds one on each node it was taken from. A node is freed once it is
//! deleted, unreferenced and its parent has already been freed, so element
//! areas are only released after every older version that could share
//! them is gone.

use super::compact::{self, MAX_BLOCK_ELEMENTS};
use super::list::{BlockDescriptor, IndexIntegerList, ListBlock};
use super::set::IndexSet;
use crate::error::{CoreError, CoreResult};
use bytes::{Buf, BufMut};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tabula_storage::{AreaId, AreaStore, MutableArea};

/// Magic value of an index set start header: "TBIS".
const INDEX_SET_MAGIC: i32 = 0x5442_4953;

/// Current index set format version.
const INDEX_SET_VERSION: i32 = 1;

/// Type tag of a blocked integer list in the index header.
const LIST_TYPE_BLOCKED: i32 = 1;

const START_HEADER_SIZE: usize = 16;
const HEADER_ENTRY_SIZE: usize = 16;
const BLOCK_ENTRY_SIZE: usize = 28;

/// Stable handle of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId {
    slot: u32,
    generation: u32,
}

/// One persisted generation of an index list.
#[derive(Debug)]
pub(crate) struct IndexBlockNode {
    area: AreaId,
    block_size: usize,
    blocks: Arc<Vec<BlockDescriptor>>,
    ref_count: usize,
    deleted: bool,
    parent: Option<NodeId>,
    orphaned_areas: Vec<AreaId>,
}

impl IndexBlockNode {
    fn element_areas(&self) -> impl Iterator<Item = AreaId> + '_ {
        self.blocks.iter().map(|b| b.area)
    }
}

#[derive(Debug, Default)]
struct NodeArena {
    slots: Vec<(u32, Option<IndexBlockNode>)>,
    free: Vec<u32>,
}

impl NodeArena {
    fn insert(&mut self, node: IndexBlockNode) -> NodeId {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.1 = Some(node);
            NodeId {
                slot,
                generation: entry.0,
            }
        } else {
            self.slots.push((0, Some(node)));
            NodeId {
                slot: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn get(&self, id: NodeId) -> Option<&IndexBlockNode> {
        match self.slots.get(id.slot as usize) {
            Some((generation, Some(node))) if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut IndexBlockNode> {
        match self.slots.get_mut(id.slot as usize) {
            Some((generation, Some(node))) if *generation == id.generation => Some(node),
            _ => None,
        }
    }

    fn remove(&mut self, id: NodeId) -> Option<IndexBlockNode> {
        let entry = self.slots.get_mut(id.slot as usize)?;
        if entry.0 != id.generation {
            return None;
        }
        let node = entry.1.take()?;
        entry.0 = entry.0.wrapping_add(1);
        self.free.push(id.slot);
        Some(node)
    }

    fn ids(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, (_, node))| node.is_some())
            .map(|(slot, (generation, _))| NodeId {
                slot: slot as u32,
                generation: *generation,
            })
            .collect()
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|(_, n)| n.is_some()).count()
    }
}

#[derive(Debug)]
struct StoreState {
    header_area: AreaId,
    indexes: Vec<NodeId>,
    arena: NodeArena,
    dropped: bool,
}

/// Durable store of one table's index lists.
///
/// Many snapshots may read concurrently; commits are serialized by the
/// store's state lock and the area store's write lock.
pub struct IndexSetStore {
    store: Arc<dyn AreaStore>,
    start_area: AreaId,
    state: Mutex<StoreState>,
    elements: RwLock<HashMap<AreaId, Arc<Vec<u32>>>>,
}

impl std::fmt::Debug for IndexSetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSetStore")
            .field("start_area", &self.start_area)
            .finish_non_exhaustive()
    }
}

fn encode_block_node(blocks: &[BlockDescriptor]) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(4 + blocks.len() * BLOCK_ENTRY_SIZE);
    buf.put_i32(blocks.len() as i32);
    for b in blocks {
        buf.put_i64(i64::from(b.first));
        buf.put_i64(i64::from(b.last));
        buf.put_i64(AreaId::to_pointer(Some(b.area)));
        buf.put_i32(compact::pack_count(b.count, b.width)?);
    }
    Ok(buf)
}

fn decode_block_node(area: AreaId, data: &[u8]) -> CoreResult<Vec<BlockDescriptor>> {
    let mut buf = data;
    if buf.remaining() < 4 {
        return Err(CoreError::corruption(format!("IndexBlock {area} truncated")));
    }
    let count = buf.get_i32();
    if count < 0 || buf.remaining() < count as usize * BLOCK_ENTRY_SIZE {
        return Err(CoreError::corruption(format!(
            "IndexBlock {area} declares {count} entries"
        )));
    }
    let mut blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let first = buf.get_i64();
        let last = buf.get_i64();
        let ptr = buf.get_i64();
        let (n, width) = compact::unpack_count(buf.get_i32());
        let element_area = AreaId::from_pointer(ptr).ok_or_else(|| {
            CoreError::corruption(format!("IndexBlock {area} has a null element pointer"))
        })?;
        blocks.push(BlockDescriptor {
            area: element_area,
            first: first as u32,
            last: last as u32,
            count: n,
            width,
        });
    }
    Ok(blocks)
}

impl IndexSetStore {
    /// Allocates an empty index set with `index_count` lists and returns the
    /// start header area to pass to [`IndexSetStore::open`].
    ///
    /// # Errors
    ///
    /// Returns an error if the area store fails.
    pub fn create(
        store: &dyn AreaStore,
        index_count: usize,
        block_size: usize,
    ) -> CoreResult<AreaId> {
        let _lock = store.lock_for_write();

        let mut header = Vec::with_capacity(4 + index_count * HEADER_ENTRY_SIZE);
        header.put_i32(index_count as i32);
        for _ in 0..index_count {
            let block = store.create_area_with(&encode_block_node(&[])?)?;
            header.put_i32(LIST_TYPE_BLOCKED);
            header.put_i32(block_size as i32);
            header.put_i64(AreaId::to_pointer(Some(block)));
        }
        let header_area = store.create_area_with(&header)?;

        let mut start = Vec::with_capacity(START_HEADER_SIZE);
        start.put_i32(INDEX_SET_MAGIC);
        start.put_i32(INDEX_SET_VERSION);
        start.put_i64(AreaId::to_pointer(Some(header_area)));
        Ok(store.create_area_with(&start)?)
    }

    /// Loads the index set rooted at `start_area`.
    ///
    /// Every current node starts with a single reference owned by the store.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` on a magic or version mismatch and
    /// `Corruption` if any header is malformed.
    pub fn open(store: Arc<dyn AreaStore>, start_area: AreaId) -> CoreResult<Arc<Self>> {
        let mut start = MutableArea::open(store.as_ref(), start_area)?;
        let magic = start.get_i32()?;
        if magic != INDEX_SET_MAGIC {
            return Err(CoreError::invalid_format(format!(
                "index set {start_area} has magic {magic:#010x}"
            )));
        }
        let version = start.get_i32()?;
        if version != INDEX_SET_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported index set version {version}"
            )));
        }
        let header_area = AreaId::from_pointer(start.get_i64()?)
            .ok_or_else(|| CoreError::corruption("index set has no header"))?;

        let header = store.read_area(header_area)?;
        let mut buf = &header[..];
        if buf.remaining() < 4 {
            return Err(CoreError::corruption("index header truncated"));
        }
        let count = buf.get_i32();
        if count < 0 || buf.remaining() < count as usize * HEADER_ENTRY_SIZE {
            return Err(CoreError::corruption(format!(
                "index header declares {count} indexes"
            )));
        }

        let mut arena = NodeArena::default();
        let mut indexes = Vec::with_capacity(count as usize);
        for n in 0..count {
            let ty = buf.get_i32();
            if ty != LIST_TYPE_BLOCKED {
                return Err(CoreError::invalid_format(format!(
                    "index {n} has unknown type {ty}"
                )));
            }
            let block_size = buf.get_i32();
            let area = AreaId::from_pointer(buf.get_i64())
                .ok_or_else(|| CoreError::corruption(format!("index {n} has no IndexBlock")))?;
            let blocks = decode_block_node(area, &store.read_area(area)?)?;
            indexes.push(arena.insert(IndexBlockNode {
                area,
                block_size: block_size.max(2) as usize,
                blocks: Arc::new(blocks),
                ref_count: 1,
                deleted: false,
                parent: None,
                orphaned_areas: Vec::new(),
            }));
        }

        Ok(Arc::new(Self {
            store,
            start_area,
            state: Mutex::new(StoreState {
                header_area,
                indexes,
                arena,
                dropped: false,
            }),
            elements: RwLock::new(HashMap::new()),
        }))
    }

    /// The start header area.
    #[must_use]
    pub fn start_area(&self) -> AreaId {
        self.start_area
    }

    /// Number of index lists.
    #[must_use]
    pub fn index_count(&self) -> usize {
        self.state.lock().indexes.len()
    }

    /// Number of live nodes, current and superseded.
    #[must_use]
    pub fn live_nodes(&self) -> usize {
        self.state.lock().arena.live()
    }

    /// Takes a snapshot of every index list.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the store was dropped.
    pub fn snapshot(self: &Arc<Self>) -> CoreResult<IndexSet> {
        let mut state = self.state.lock();
        if state.dropped {
            return Err(CoreError::invalid_operation("index set store was dropped"));
        }
        let nodes = state.indexes.clone();
        for id in &nodes {
            if let Some(node) = state.arena.get_mut(*id) {
                node.ref_count += 1;
            }
        }
        Ok(IndexSet::new(Arc::clone(self), nodes))
    }

    /// Adds one reference to each of `nodes`.
    pub(crate) fn retain(&self, nodes: &[NodeId]) {
        let mut state = self.state.lock();
        for id in nodes {
            if let Some(node) = state.arena.get_mut(*id) {
                node.ref_count += 1;
            }
        }
    }

    /// Drops one reference from each of `nodes` and frees what became
    /// unreachable.
    pub(crate) fn release(&self, nodes: &[NodeId]) {
        let _lock = self.store.lock_for_write();
        let mut state = self.state.lock();
        for id in nodes {
            match state.arena.get_mut(*id) {
                Some(node) if node.ref_count > 0 => node.ref_count -= 1,
                _ => tracing::warn!(?id, "released an index node that holds no reference"),
            }
        }
        self.collect(&mut state);
    }

    /// Builds a working list from a node.
    pub(crate) fn materialize(&self, id: NodeId) -> CoreResult<IndexIntegerList> {
        let (descriptors, block_size) = {
            let state = self.state.lock();
            let node = state
                .arena
                .get(id)
                .ok_or_else(|| CoreError::corruption("snapshot refers to a freed index node"))?;
            (Arc::clone(&node.blocks), node.block_size)
        };

        let mut blocks = Vec::with_capacity(descriptors.len());
        for desc in descriptors.iter() {
            blocks.push(ListBlock {
                stored: Some(*desc),
                elements: self.load_elements(desc)?,
            });
        }
        Ok(IndexIntegerList::from_blocks(blocks, block_size))
    }

    fn load_elements(&self, desc: &BlockDescriptor) -> CoreResult<Arc<Vec<u32>>> {
        if let Some(elements) = self.elements.read().get(&desc.area) {
            return Ok(Arc::clone(elements));
        }
        let data = self.store.read_area(desc.area)?;
        let elements = Arc::new(compact::decode_elements(&data, desc.count, desc.width)?);
        self.elements
            .write()
            .insert(desc.area, Arc::clone(&elements));
        Ok(elements)
    }

    fn write_block(&self, block: &ListBlock) -> CoreResult<BlockDescriptor> {
        if let Some(stored) = block.stored {
            return Ok(stored);
        }
        let elements = &block.elements;
        if elements.len() > MAX_BLOCK_ELEMENTS {
            return Err(CoreError::invalid_operation("index block too large"));
        }
        let (bytes, width) = compact::encode_elements(elements);
        let area = self.store.create_area_with(&bytes)?;
        self.elements.write().insert(area, Arc::clone(elements));
        Ok(BlockDescriptor {
            area,
            first: elements.first().copied().unwrap_or(0),
            last: elements.last().copied().unwrap_or(0),
            count: elements.len(),
            width,
        })
    }

    /// Writes a new node for index `n` holding `blocks`, making it current.
    fn replace_node(
        &self,
        state: &mut StoreState,
        n: usize,
        blocks: Vec<BlockDescriptor>,
        block_size: usize,
    ) -> CoreResult<()> {
        let area = self.store.create_area_with(&encode_block_node(&blocks)?)?;
        let old_id = state.indexes[n];

        let kept: HashSet<AreaId> = blocks.iter().map(|b| b.area).collect();
        if let Some(old) = state.arena.get_mut(old_id) {
            let orphans: Vec<AreaId> = old.element_areas().filter(|a| !kept.contains(a)).collect();
            old.orphaned_areas.extend(orphans);
            old.deleted = true;
            old.ref_count = old.ref_count.saturating_sub(1);
        }

        state.indexes[n] = state.arena.insert(IndexBlockNode {
            area,
            block_size,
            blocks: Arc::new(blocks),
            ref_count: 1,
            deleted: false,
            parent: Some(old_id),
            orphaned_areas: Vec::new(),
        });
        Ok(())
    }

    /// Persists every list of `set` that was changed.
    ///
    /// Unchanged element blocks are reused by pointer. The replaced nodes
    /// stay readable by older snapshots until they are released.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if a changed list was not derived from
    /// the current version of its index.
    pub fn commit_index_set(&self, set: &IndexSet) -> CoreResult<()> {
        let _lock = self.store.lock_for_write();
        let mut state = self.state.lock();
        Self::ensure_committable(&state, set)?;

        let changed: Vec<(usize, &IndexIntegerList)> = set.modified_lists().collect();
        if changed.is_empty() {
            return Ok(());
        }
        for (n, list) in changed {
            let blocks = list
                .blocks()
                .iter()
                .map(|b| self.write_block(b))
                .collect::<CoreResult<Vec<_>>>()?;
            self.replace_node(&mut state, n, blocks, list.block_size())?;
        }

        self.rewrite_header(&mut state)?;
        self.collect(&mut state);
        Ok(())
    }

    /// Checks that [`IndexSetStore::commit_index_set`] would accept `set`
    /// without writing anything.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the store was dropped or a changed
    /// list is stale.
    pub fn check_committable(&self, set: &IndexSet) -> CoreResult<()> {
        Self::ensure_committable(&self.state.lock(), set)
    }

    fn ensure_committable(state: &StoreState, set: &IndexSet) -> CoreResult<()> {
        if state.dropped {
            return Err(CoreError::invalid_operation("index set store was dropped"));
        }
        for (n, _) in set.modified_lists() {
            if state.indexes.get(n) != set.nodes().get(n) {
                return Err(CoreError::invalid_operation(format!(
                    "index {n} changed since the snapshot was taken"
                )));
            }
        }
        Ok(())
    }

    /// The current header area and node of every index list.
    pub(crate) fn current_version(&self) -> (AreaId, Vec<NodeId>) {
        let state = self.state.lock();
        (state.header_area, state.indexes.clone())
    }

    /// Replaces index `n` with an empty list.
    ///
    /// Transactions never call this; it serves column index changes made
    /// by the catalog layer embedding the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if `n` is out of range or the area store fails.
    pub fn commit_drop_index(&self, n: usize) -> CoreResult<()> {
        let _lock = self.store.lock_for_write();
        let mut state = self.state.lock();
        let id = *state
            .indexes
            .get(n)
            .ok_or_else(|| CoreError::invalid_operation(format!("no index {n}")))?;
        let block_size = state.arena.get(id).map_or(2, |node| node.block_size);
        self.replace_node(&mut state, n, Vec::new(), block_size)?;
        self.rewrite_header(&mut state)?;
        self.collect(&mut state);
        Ok(())
    }

    /// Appends `count` empty index lists.
    ///
    /// Like [`IndexSetStore::commit_drop_index`], this serves schema
    /// changes made by the catalog layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the area store fails.
    pub fn add_index_lists(&self, count: usize, block_size: usize) -> CoreResult<()> {
        let _lock = self.store.lock_for_write();
        let mut state = self.state.lock();
        for _ in 0..count {
            let area = self.store.create_area_with(&encode_block_node(&[])?)?;
            let id = state.arena.insert(IndexBlockNode {
                area,
                block_size: block_size.max(2),
                blocks: Arc::new(Vec::new()),
                ref_count: 1,
                deleted: false,
                parent: None,
                orphaned_areas: Vec::new(),
            });
            state.indexes.push(id);
        }
        self.rewrite_header(&mut state)
    }

    /// Releases every area of the store. Nodes still held by snapshots are
    /// freed as those snapshots are released.
    pub fn drop_all(&self) {
        let _lock = self.store.lock_for_write();
        let mut state = self.state.lock();
        if state.dropped {
            return;
        }
        state.dropped = true;

        for id in std::mem::take(&mut state.indexes) {
            if let Some(node) = state.arena.get_mut(id) {
                let areas: Vec<AreaId> = node.element_areas().collect();
                node.orphaned_areas.extend(areas);
                node.deleted = true;
                node.ref_count = node.ref_count.saturating_sub(1);
            }
        }
        self.delete_quietly(state.header_area);
        self.delete_quietly(self.start_area);
        self.collect(&mut state);
    }

    fn rewrite_header(&self, state: &mut StoreState) -> CoreResult<()> {
        let mut header = Vec::with_capacity(4 + state.indexes.len() * HEADER_ENTRY_SIZE);
        header.put_i32(state.indexes.len() as i32);
        for id in &state.indexes {
            let node = state
                .arena
                .get(*id)
                .ok_or_else(|| CoreError::corruption("current index node missing"))?;
            header.put_i32(LIST_TYPE_BLOCKED);
            header.put_i32(node.block_size as i32);
            header.put_i64(AreaId::to_pointer(Some(node.area)));
        }
        let new_header = self.store.create_area_with(&header)?;

        let mut start = MutableArea::open(self.store.as_ref(), self.start_area)?;
        start.set_position(8)?;
        start.put_i64(AreaId::to_pointer(Some(new_header)))?;

        let old = std::mem::replace(&mut state.header_area, new_header);
        self.delete_quietly(old);
        Ok(())
    }

    /// Frees every node that is deleted, unreferenced and whose parent is
    /// gone, until nothing more can be freed.
    fn collect(&self, state: &mut StoreState) -> usize {
        let mut freed = 0;
        loop {
            let ready: Vec<NodeId> = state
                .arena
                .ids()
                .into_iter()
                .filter(|id| {
                    state.arena.get(*id).is_some_and(|node| {
                        node.deleted
                            && node.ref_count == 0
                            && node.parent.map_or(true, |p| state.arena.get(p).is_none())
                    })
                })
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                if let Some(node) = state.arena.remove(id) {
                    self.delete_quietly(node.area);
                    let mut cache = self.elements.write();
                    for area in node.orphaned_areas {
                        cache.remove(&area);
                        self.delete_quietly(area);
                    }
                    freed += 1;
                }
            }
        }
        if freed > 0 {
            tracing::debug!(start = %self.start_area, freed, "freed index nodes");
        }
        freed
    }

    fn delete_quietly(&self, area: AreaId) {
        if let Err(err) = self.store.delete_area(area) {
            tracing::warn!(%area, error = %err, "failed to delete index area");
        }
    }
}

//! Point-in-time snapshot of a table's index lists.

use super::list::IndexIntegerList;
use super::store::{IndexSetStore, NodeId};
use crate::error::{CoreError, CoreResult};
use std::sync::Arc;

/// A snapshot of every index list of one table.
///
/// Lists are materialized on first access and are private working copies:
/// changing one never affects another snapshot. Dropping the set releases
/// its references on the store's nodes.
pub struct IndexSet {
    store: Arc<IndexSetStore>,
    nodes: Vec<NodeId>,
    lists: Vec<Option<IndexIntegerList>>,
}

impl std::fmt::Debug for IndexSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSet")
            .field("indexes", &self.nodes.len())
            .field("materialized", &self.lists.iter().filter(|l| l.is_some()).count())
            .finish()
    }
}

impl IndexSet {
    pub(crate) fn new(store: Arc<IndexSetStore>, nodes: Vec<NodeId>) -> Self {
        let lists = nodes.iter().map(|_| None).collect();
        Self {
            store,
            nodes,
            lists,
        }
    }

    /// Number of index lists in the snapshot.
    #[must_use]
    pub fn index_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Returns the working copy of index `n`, loading it on first access.
    ///
    /// # Errors
    ///
    /// Returns an error if `n` is out of range or the list cannot be read.
    pub fn get_index(&mut self, n: usize) -> CoreResult<&mut IndexIntegerList> {
        let node = *self
            .nodes
            .get(n)
            .ok_or_else(|| CoreError::invalid_operation(format!("no index {n} in snapshot")))?;
        let slot = &mut self.lists[n];
        if slot.is_none() {
            *slot = Some(self.store.materialize(node)?);
        }
        slot.as_mut()
            .ok_or_else(|| CoreError::corruption("index list vanished"))
    }

    /// Whether any materialized list was changed.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.lists.iter().flatten().any(IndexIntegerList::is_modified)
    }

    pub(crate) fn modified_lists(&self) -> impl Iterator<Item = (usize, &IndexIntegerList)> {
        self.lists
            .iter()
            .enumerate()
            .filter_map(|(n, l)| l.as_ref().filter(|l| l.is_modified()).map(|l| (n, l)))
    }

    /// Creates an independent copy holding its own node references.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        self.store.retain(&self.nodes);
        Self {
            store: Arc::clone(&self.store),
            nodes: self.nodes.clone(),
            lists: self.lists.clone(),
        }
    }
}

impl Drop for IndexSet {
    fn drop(&mut self) {
        self.store.release(&self.nodes);
    }
}

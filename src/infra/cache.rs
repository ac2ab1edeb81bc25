//! Transaction-scoped cache of Merkle subtrees.
//!
//! Internal nodes are persisted in fixed-stride subtree blocks keyed by
//! `(tree_id, subtree_id, revision)`. Within a transaction this cache holds
//! the subtrees read at the read revision plus a dirty overlay staged for
//! the write revision; `flush` copies unchanged sibling nodes forward so
//! every written subtree is complete and self-contained at its revision.
//!
//! The cache itself is revision-agnostic: the owning transaction performs
//! the "highest revision <= read revision" lookups and hands blobs in via
//! [`SubtreeCache::supply`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::domain::{hash_hex, Hash, NodeId, NodeSlot, SubtreeCoord, TreeNode, SUBTREE_STRIDE};

use super::{Result, StorageError};

/// One persisted subtree block: the nodes of a single band, keyed by slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subtree {
    nodes: BTreeMap<NodeSlot, Hash>,
}

/// Wire form of a subtree node.
#[derive(Serialize, Deserialize)]
struct StoredNode {
    level: u8,
    index: u64,
    #[serde(with = "hash_hex")]
    hash: Hash,
}

impl Subtree {
    pub fn get(&self, slot: &NodeSlot) -> Option<&Hash> {
        self.nodes.get(slot)
    }

    pub fn insert(&mut self, slot: NodeSlot, hash: Hash) {
        self.nodes.insert(slot, hash);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Serialize for storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        let stored: Vec<StoredNode> = self
            .nodes
            .iter()
            .map(|(slot, hash)| StoredNode {
                level: slot.level,
                index: slot.index,
                hash: *hash,
            })
            .collect();
        serde_json::to_vec(&stored).expect("subtree serialization cannot fail")
    }

    /// Deserialize a stored subtree blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let stored: Vec<StoredNode> = serde_json::from_slice(bytes)
            .map_err(|e| StorageError::Internal(format!("corrupt subtree blob: {e}")))?;
        let mut nodes = BTreeMap::new();
        for n in stored {
            nodes.insert(
                NodeSlot {
                    level: n.level,
                    index: n.index,
                },
                n.hash,
            );
        }
        Ok(Self { nodes })
    }
}

/// Revisioned subtree cache bound to one transaction.
pub struct SubtreeCache {
    stride: u8,
    /// Subtrees read at the read revision. `None` records a known-absent
    /// subtree so repeated lookups stay local.
    loaded: HashMap<SubtreeCoord, Option<Subtree>>,
    /// Nodes staged for the write revision.
    dirty: HashMap<SubtreeCoord, BTreeMap<NodeSlot, Hash>>,
}

impl SubtreeCache {
    pub fn new() -> Self {
        Self {
            stride: SUBTREE_STRIDE,
            loaded: HashMap::new(),
            dirty: HashMap::new(),
        }
    }

    pub fn stride(&self) -> u8 {
        self.stride
    }

    /// Deduplicated subtree coordinates covering the given node ids.
    pub fn coords_for(&self, ids: &[NodeId]) -> Vec<SubtreeCoord> {
        let mut coords: Vec<SubtreeCoord> = ids
            .iter()
            .map(|id| id.subtree_coords(self.stride).0)
            .collect();
        coords.sort();
        coords.dedup();
        coords
    }

    /// Of `coords`, those not yet supplied by the backing store.
    pub fn missing(&self, coords: &[SubtreeCoord]) -> Vec<SubtreeCoord> {
        coords
            .iter()
            .filter(|c| !self.loaded.contains_key(c))
            .copied()
            .collect()
    }

    /// Record the backing store's answer for one subtree at the read
    /// revision (`None` = no such subtree at or below that revision).
    pub fn supply(&mut self, coord: SubtreeCoord, subtree: Option<Subtree>) {
        self.loaded.insert(coord, subtree);
    }

    /// Resolve one node. Dirty nodes win over the read revision. Returns
    /// `Ok(None)` for nodes absent at both revisions.
    ///
    /// The enclosing subtree must have been supplied first.
    pub fn get(&self, id: NodeId) -> Result<Option<Hash>> {
        let (coord, slot) = id.subtree_coords(self.stride);
        if let Some(hash) = self.dirty.get(&coord).and_then(|m| m.get(&slot)) {
            return Ok(Some(*hash));
        }
        match self.loaded.get(&coord) {
            Some(Some(subtree)) => Ok(subtree.get(&slot).copied()),
            Some(None) => Ok(None),
            None => Err(StorageError::Internal(format!(
                "subtree for node {id} read before being loaded"
            ))),
        }
    }

    /// Stage one node at the write revision.
    pub fn set(&mut self, node: TreeNode) {
        let (coord, slot) = node.id.subtree_coords(self.stride);
        self.dirty.entry(coord).or_default().insert(slot, node.hash);
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Coordinates with staged writes, for preloading before `flush`.
    pub fn dirty_coords(&self) -> Vec<SubtreeCoord> {
        let mut coords: Vec<SubtreeCoord> = self.dirty.keys().copied().collect();
        coords.sort();
        coords
    }

    /// Produce the complete subtrees to write at the write revision.
    ///
    /// Unchanged sibling nodes are copied forward from the read revision,
    /// which must have been supplied for every dirty coordinate.
    pub fn flush(&mut self) -> Result<Vec<(SubtreeCoord, Subtree)>> {
        let mut out = Vec::with_capacity(self.dirty.len());
        let dirty = std::mem::take(&mut self.dirty);
        for (coord, staged) in dirty {
            let mut merged = match self.loaded.get(&coord) {
                Some(Some(subtree)) => subtree.clone(),
                Some(None) => Subtree::default(),
                None => {
                    return Err(StorageError::Internal(format!(
                        "dirty subtree (band {}, prefix {}) flushed before being loaded",
                        coord.band, coord.prefix
                    )))
                }
            };
            for (slot, hash) in staged {
                merged.insert(slot, hash);
            }
            out.push((coord, merged));
        }
        out.sort_by_key(|(coord, _)| *coord);
        Ok(out)
    }
}

impl Default for SubtreeCache {
    fn default() -> Self {
        Self::new()
    }
}

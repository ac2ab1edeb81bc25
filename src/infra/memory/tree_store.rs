//! Per-tree copy-on-write key space.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{Hash, LogLeaf, SignedLogRoot, SubtreeCoord, TreeId, TreeMeta};
use crate::infra::cache::Subtree;
use crate::infra::{Result, StorageError};

/// Identity-hash index entry. A leaf is first known by its queued form and
/// later by its position in the sequenced store.
#[derive(Debug, Clone)]
pub(super) enum IdentityEntry {
    Queued(LogLeaf),
    Sequenced(i64),
}

/// Everything stored for one tree. Cloned wholesale by write transactions.
#[derive(Debug, Clone, Default)]
pub(super) struct TreeData {
    /// FIFO of unsequenced leaves, insertion ordered.
    pub queue: VecDeque<LogLeaf>,
    /// Dense map `leaf_index -> leaf`.
    pub leaves_by_index: BTreeMap<i64, LogLeaf>,
    /// Secondary index `merkle_leaf_hash -> [leaf_index]`.
    pub indices_by_merkle: HashMap<Hash, Vec<i64>>,
    /// Identity-hash uniqueness index across queue and sequenced store.
    pub identity: HashMap<Hash, IdentityEntry>,
    /// Serialized subtrees by coordinate and revision.
    pub subtrees: HashMap<SubtreeCoord, BTreeMap<i64, Subtree>>,
    /// Signed roots keyed by timestamp.
    pub roots_by_timestamp: BTreeMap<i64, SignedLogRoot>,
    /// Timestamp of the latest signed root. Staged like everything else:
    /// only a committed transaction can move it.
    pub current_root_timestamp: Option<i64>,
}

impl TreeData {
    /// The latest signed root, if any.
    pub fn latest_root(&self) -> Option<&SignedLogRoot> {
        self.current_root_timestamp
            .and_then(|ts| self.roots_by_timestamp.get(&ts))
    }

    /// Resolve an identity hash to the leaf it denotes.
    pub fn leaf_by_identity(&self, identity_hash: &Hash) -> Option<LogLeaf> {
        match self.identity.get(identity_hash)? {
            IdentityEntry::Queued(leaf) => Some(leaf.clone()),
            IdentityEntry::Sequenced(index) => self.leaves_by_index.get(index).cloned(),
        }
    }

    /// The stored subtree at the highest revision `<= revision`.
    pub fn subtree_at(&self, coord: SubtreeCoord, revision: i64) -> Option<Subtree> {
        self.subtrees
            .get(&coord)?
            .range(..=revision)
            .next_back()
            .map(|(_, subtree)| subtree.clone())
    }
}

/// One tree: immutable metadata, a write lock, and the current snapshot.
pub(super) struct MemTree {
    pub meta: TreeMeta,
    write_lock: Arc<Mutex<()>>,
    data: RwLock<Arc<TreeData>>,
}

impl MemTree {
    fn new(meta: TreeMeta) -> Self {
        Self {
            meta,
            write_lock: Arc::new(Mutex::new(())),
            data: RwLock::new(Arc::new(TreeData::default())),
        }
    }

    /// The latest committed state.
    pub fn snapshot(&self) -> Arc<TreeData> {
        Arc::clone(&self.data.read().expect("tree lock poisoned"))
    }

    /// Acquire the single-writer lock. Blocks while another write
    /// transaction is in flight.
    pub async fn acquire_write(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.write_lock).lock_owned().await
    }

    /// Atomically replace the snapshot. Caller must hold the write lock.
    pub fn publish(&self, data: TreeData) {
        *self.data.write().expect("tree lock poisoned") = Arc::new(data);
    }
}

/// The in-memory store: a set of trees.
#[derive(Default)]
pub struct MemoryTreeStore {
    trees: RwLock<HashMap<TreeId, Arc<MemTree>>>,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tree. Fails if the ID is taken.
    pub fn add_tree(&self, meta: TreeMeta) -> Result<()> {
        let mut trees = self.trees.write().expect("store lock poisoned");
        if trees.contains_key(&meta.id) {
            return Err(StorageError::InvalidArgument(format!(
                "tree {} already exists",
                meta.id
            )));
        }
        trees.insert(meta.id, Arc::new(MemTree::new(meta)));
        Ok(())
    }

    pub(super) fn get_tree(&self, tree_id: TreeId) -> Result<Arc<MemTree>> {
        self.trees
            .read()
            .expect("store lock poisoned")
            .get(&tree_id)
            .cloned()
            .ok_or(StorageError::TreeNotFound(tree_id))
    }

    /// Metadata of every registered tree.
    pub fn tree_metas(&self) -> Vec<TreeMeta> {
        let mut metas: Vec<TreeMeta> = self
            .trees
            .read()
            .expect("store lock poisoned")
            .values()
            .map(|t| t.meta.clone())
            .collect();
        metas.sort_by_key(|m| m.id);
        metas
    }
}

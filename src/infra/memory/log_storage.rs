//! In-memory log storage.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::instrument;

use crate::domain::{
    Hash, LogLeaf, NodeId, QueuedLeaf, SignedLogRoot, TreeId, TreeMeta, TreeNode, TreeType,
};
use crate::infra::cache::SubtreeCache;
use crate::infra::{LogStorage, LogTx, ReadOnlyLogTx, Result, StorageError, StorageProvider};
use crate::metrics::StorageMetrics;

use super::tree_store::{IdentityEntry, MemTree, TreeData};
use super::MemoryTreeStore;

/// Log storage over [`MemoryTreeStore`].
pub struct MemoryLogStorage {
    store: Arc<MemoryTreeStore>,
    metrics: Arc<StorageMetrics>,
}

impl MemoryLogStorage {
    pub fn new(store: Arc<MemoryTreeStore>, metrics: Arc<StorageMetrics>) -> Self {
        Self { store, metrics }
    }

    async fn begin(&self, tree: &TreeMeta, readonly: bool) -> Result<MemoryLogTx> {
        let mem = self.store.get_tree(tree.id)?;
        let guard = if readonly {
            None
        } else {
            Some(mem.acquire_write().await)
        };
        // Snapshot after taking the lock, so a writer observes the state the
        // previous writer committed.
        let snapshot = mem.snapshot();
        let root = snapshot.latest_root().cloned();
        let read_rev = root.as_ref().map(|r| r.root.revision).unwrap_or(0);
        let working = (!readonly).then(|| Box::new((*snapshot).clone()));

        Ok(MemoryLogTx {
            tree_id: tree.id,
            tree: mem,
            _guard: guard,
            snapshot,
            working,
            root,
            read_rev,
            write_rev: read_rev + 1,
            cache: SubtreeCache::new(),
            metrics: Arc::clone(&self.metrics),
            pending_queued: 0,
            pending_dequeued: 0,
        })
    }
}

#[async_trait]
impl LogStorage for MemoryLogStorage {
    async fn check_database_accessible(&self) -> Result<()> {
        Ok(())
    }

    async fn get_active_log_ids(&self) -> Result<Vec<TreeId>> {
        Ok(self
            .store
            .tree_metas()
            .iter()
            .filter(|meta| meta.needs_sequencing())
            .map(|meta| meta.id)
            .collect())
    }

    #[instrument(skip(self, tree), fields(tree_id = %tree.id))]
    async fn snapshot_for_tree(&self, tree: &TreeMeta) -> Result<Box<dyn ReadOnlyLogTx>> {
        Ok(Box::new(self.begin(tree, true).await?))
    }

    #[instrument(skip(self, tree), fields(tree_id = %tree.id))]
    async fn begin_for_tree(&self, tree: &TreeMeta) -> Result<Box<dyn LogTx>> {
        Ok(Box::new(self.begin(tree, false).await?))
    }
}

/// A transaction over one in-memory tree.
///
/// Read-only transactions observe the snapshot taken at begin; read-write
/// transactions mutate a private clone that is published at commit.
struct MemoryLogTx {
    tree_id: TreeId,
    tree: Arc<MemTree>,
    _guard: Option<OwnedMutexGuard<()>>,
    snapshot: Arc<TreeData>,
    working: Option<Box<TreeData>>,
    root: Option<SignedLogRoot>,
    read_rev: i64,
    write_rev: i64,
    cache: SubtreeCache,
    metrics: Arc<StorageMetrics>,
    pending_queued: u64,
    pending_dequeued: u64,
}

impl MemoryLogTx {
    fn working_mut(&mut self) -> Result<&mut TreeData> {
        self.working.as_deref_mut().ok_or_else(|| {
            StorageError::Internal("write operation on a read-only transaction".to_string())
        })
    }

    fn data(&self) -> &TreeData {
        self.working.as_deref().unwrap_or(&self.snapshot)
    }

    /// Pull any not-yet-loaded subtrees for `coords` out of the tree state
    /// at the read revision and hand them to the cache.
    fn load_subtrees(&mut self, coords: &[crate::domain::SubtreeCoord]) {
        let missing = self.cache.missing(coords);
        if missing.is_empty() {
            return;
        }
        let mut fetched = Vec::with_capacity(missing.len());
        {
            let read_rev = self.read_rev;
            let data = self.working.as_deref().unwrap_or(&self.snapshot);
            for coord in missing {
                fetched.push((coord, data.subtree_at(coord, read_rev)));
            }
        }
        for (coord, subtree) in fetched {
            self.cache.supply(coord, subtree);
        }
    }
}

#[async_trait]
impl ReadOnlyLogTx for MemoryLogTx {
    async fn latest_signed_log_root(&mut self) -> Result<SignedLogRoot> {
        self.root
            .clone()
            .ok_or(StorageError::TreeNeedsInit(self.tree_id))
    }

    async fn get_leaves_by_range(&mut self, start: i64, count: i64) -> Result<Vec<LogLeaf>> {
        if start < 0 || count <= 0 {
            return Err(StorageError::InvalidArgument(format!(
                "invalid range: start {start}, count {count}"
            )));
        }
        let data = self.data();
        let mut leaves = Vec::new();
        for i in 0..count {
            match data.leaves_by_index.get(&(start + i)) {
                Some(leaf) => leaves.push(leaf.clone()),
                None => break,
            }
        }
        Ok(leaves)
    }

    async fn get_leaves_by_hash(
        &mut self,
        merkle_hashes: &[Hash],
        order_by_sequence: bool,
    ) -> Result<Vec<LogLeaf>> {
        let data = self.data();
        let mut leaves = Vec::new();
        for hash in merkle_hashes {
            let Some(indices) = data.indices_by_merkle.get(hash) else {
                continue;
            };
            for index in indices {
                if let Some(leaf) = data.leaves_by_index.get(index) {
                    leaves.push(leaf.clone());
                }
            }
        }
        if order_by_sequence {
            leaves.sort_by_key(|leaf| leaf.leaf_index);
        }
        Ok(leaves)
    }

    async fn get_merkle_nodes(&mut self, ids: &[NodeId]) -> Result<Vec<TreeNode>> {
        let coords = self.cache.coords_for(ids);
        self.load_subtrees(&coords);

        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(hash) = self.cache.get(*id)? {
                nodes.push(TreeNode { id: *id, hash });
            }
        }
        Ok(nodes)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        // Dropping the transaction discards the working copy and releases
        // the write lock.
        Ok(())
    }
}

#[async_trait]
impl LogTx for MemoryLogTx {
    fn tree_id(&self) -> TreeId {
        self.tree_id
    }

    fn write_revision(&self) -> i64 {
        self.write_rev
    }

    async fn queue_leaves(
        &mut self,
        leaves: Vec<LogLeaf>,
        queue_timestamp_nanos: i64,
    ) -> Result<Vec<Option<LogLeaf>>> {
        let mut queued = 0u64;
        let mut results = Vec::with_capacity(leaves.len());

        let working = self.working_mut()?;
        for mut leaf in leaves {
            if let Some(existing) = working.leaf_by_identity(&leaf.leaf_identity_hash) {
                results.push(Some(existing));
                continue;
            }
            leaf.queue_timestamp_nanos = queue_timestamp_nanos;
            working
                .identity
                .insert(leaf.leaf_identity_hash, IdentityEntry::Queued(leaf.clone()));
            working.queue.push_back(leaf);
            queued += 1;
            results.push(None);
        }

        self.pending_queued += queued;
        Ok(results)
    }

    async fn add_sequenced_leaves(
        &mut self,
        leaves: Vec<LogLeaf>,
        timestamp_nanos: i64,
    ) -> Result<Vec<QueuedLeaf>> {
        if self.tree.meta.tree_type != TreeType::PreorderedLog {
            return Err(StorageError::Unimplemented("AddSequencedLeaves"));
        }
        let tree_id = self.tree_id;
        let working = self.working_mut()?;
        let mut results = Vec::with_capacity(leaves.len());
        for mut leaf in leaves {
            if leaf.leaf_index < 0 {
                return Err(StorageError::InvalidArgument(format!(
                    "sequenced leaf must carry a non-negative index, got {}",
                    leaf.leaf_index
                )));
            }
            if let Some(existing) = working.leaf_by_identity(&leaf.leaf_identity_hash) {
                results.push(QueuedLeaf::already_exists(existing));
                continue;
            }
            if working.leaves_by_index.contains_key(&leaf.leaf_index) {
                return Err(StorageError::Integrity {
                    tree_id,
                    message: format!("leaf index {} written twice", leaf.leaf_index),
                });
            }
            leaf.queue_timestamp_nanos = timestamp_nanos;
            leaf.integrate_timestamp_nanos = timestamp_nanos;
            working
                .indices_by_merkle
                .entry(leaf.merkle_leaf_hash)
                .or_default()
                .push(leaf.leaf_index);
            working
                .identity
                .insert(leaf.leaf_identity_hash, IdentityEntry::Sequenced(leaf.leaf_index));
            results.push(QueuedLeaf::ok(leaf.clone()));
            working.leaves_by_index.insert(leaf.leaf_index, leaf);
        }
        Ok(results)
    }

    async fn dequeue_leaves(&mut self, limit: usize, cutoff_nanos: i64) -> Result<Vec<LogLeaf>> {
        let working = self.working_mut()?;
        let mut leaves = Vec::with_capacity(limit.min(working.queue.len()));
        for entry in working.queue.iter() {
            if leaves.len() >= limit {
                break;
            }
            if entry.queue_timestamp_nanos <= cutoff_nanos {
                leaves.push(entry.clone());
            }
        }
        self.pending_dequeued += leaves.len() as u64;
        Ok(leaves)
    }

    async fn update_sequenced_leaves(&mut self, leaves: Vec<LogLeaf>) -> Result<()> {
        let tree_id = self.tree_id;
        let working = self.working_mut()?;

        let mut count_by_merkle: HashMap<Hash, usize> = HashMap::new();
        for leaf in leaves {
            *count_by_merkle.entry(leaf.merkle_leaf_hash).or_default() += 1;
            if working.leaves_by_index.contains_key(&leaf.leaf_index) {
                return Err(StorageError::Integrity {
                    tree_id,
                    message: format!("leaf index {} written twice", leaf.leaf_index),
                });
            }
            working
                .indices_by_merkle
                .entry(leaf.merkle_leaf_hash)
                .or_default()
                .push(leaf.leaf_index);
            working
                .identity
                .insert(leaf.leaf_identity_hash, IdentityEntry::Sequenced(leaf.leaf_index));
            working.leaves_by_index.insert(leaf.leaf_index, leaf);
        }

        // Remove the matching queue entries, one per sequenced leaf.
        working.queue.retain(|entry| {
            match count_by_merkle.get_mut(&entry.merkle_leaf_hash) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    false
                }
                _ => true,
            }
        });

        let unknown: usize = count_by_merkle.values().sum();
        if unknown != 0 {
            return Err(StorageError::Integrity {
                tree_id,
                message: format!("attempted to update {unknown} leaves missing from the queue"),
            });
        }
        Ok(())
    }

    async fn set_merkle_nodes(&mut self, nodes: Vec<TreeNode>) -> Result<()> {
        if self.working.is_none() {
            return Err(StorageError::Internal(
                "write operation on a read-only transaction".to_string(),
            ));
        }
        for node in nodes {
            self.cache.set(node);
        }
        Ok(())
    }

    async fn store_signed_log_root(&mut self, mut root: SignedLogRoot) -> Result<()> {
        let tree_id = self.tree_id;
        root.root.revision = self.write_rev;
        let timestamp = root.root.timestamp_nanos;

        let working = self.working_mut()?;
        if working.roots_by_timestamp.contains_key(&timestamp) {
            return Err(StorageError::RootAlreadyExists {
                tree_id,
                timestamp_nanos: timestamp,
            });
        }
        working.roots_by_timestamp.insert(timestamp, root);
        let advance = working
            .current_root_timestamp
            .map_or(true, |current| timestamp > current);
        if advance {
            working.current_root_timestamp = Some(timestamp);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tree_id = %self.tree_id, write_rev = self.write_rev))]
    async fn commit(mut self: Box<Self>) -> Result<()> {
        if self.working.is_none() {
            return Err(StorageError::Internal(
                "commit on a read-only transaction".to_string(),
            ));
        }

        // Flush dirty subtrees at the write revision, copying untouched
        // siblings forward from the read revision.
        if self.cache.has_dirty() {
            let dirty = self.cache.dirty_coords();
            self.load_subtrees(&dirty);
            let flushed = self.cache.flush()?;
            let write_rev = self.write_rev;
            let working = self.working.as_deref_mut().expect("checked above");
            for (coord, subtree) in flushed {
                working
                    .subtrees
                    .entry(coord)
                    .or_default()
                    .insert(write_rev, subtree);
            }
        }

        let working = *self.working.take().expect("checked above");
        self.tree.publish(working);

        self.metrics.add_queued(self.tree_id, self.pending_queued);
        self.metrics.add_dequeued(self.tree_id, self.pending_dequeued);
        Ok(())
    }
}

/// Provider wrapping one in-memory store.
pub struct MemoryStorageProvider {
    store: Arc<MemoryTreeStore>,
    log: Arc<MemoryLogStorage>,
}

impl MemoryStorageProvider {
    pub fn new(metrics: Arc<StorageMetrics>) -> Self {
        let store = Arc::new(MemoryTreeStore::new());
        let log = Arc::new(MemoryLogStorage::new(Arc::clone(&store), metrics));
        Self { store, log }
    }

    /// The underlying tree store, for registering trees.
    pub fn tree_store(&self) -> &Arc<MemoryTreeStore> {
        &self.store
    }
}

#[async_trait]
impl StorageProvider for MemoryStorageProvider {
    fn log_storage(&self) -> Arc<dyn LogStorage> {
        Arc::clone(&self.log) as Arc<dyn LogStorage>
    }

    async fn check_database_accessible(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

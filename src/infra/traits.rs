//! Trait definitions for the log storage core.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;

use crate::domain::{
    Hash, LogLeaf, NodeId, QueuedLeaf, SignedLogRoot, TreeId, TreeMeta, TreeNode, TreeType,
};

use super::{Result, StorageError};

/// Read-only view of one tree at a consistent revision.
///
/// A snapshot observes the latest committed revision as of `begin` and is
/// unaffected by concurrent writers.
#[async_trait]
pub trait ReadOnlyLogTx: Send {
    /// The single latest signed root.
    ///
    /// Returns [`StorageError::TreeNeedsInit`] when the tree has never
    /// committed a root.
    async fn latest_signed_log_root(&mut self) -> Result<SignedLogRoot>;

    /// Up to `count` sequenced leaves from `[start, start+count)`, in index
    /// order, stopping at the first missing index.
    async fn get_leaves_by_range(&mut self, start: i64, count: i64) -> Result<Vec<LogLeaf>>;

    /// All sequenced leaves whose Merkle leaf hash matches any input hash.
    async fn get_leaves_by_hash(
        &mut self,
        merkle_hashes: &[Hash],
        order_by_sequence: bool,
    ) -> Result<Vec<LogLeaf>>;

    /// The requested internal nodes at the read revision. Nodes not yet
    /// written at that revision are omitted from the result.
    async fn get_merkle_nodes(&mut self, ids: &[NodeId]) -> Result<Vec<TreeNode>>;

    /// Release the transaction without committing. Discards staged writes.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Read-write unit of work on one tree.
///
/// At most one is in flight per tree at any time; the backing store's lock
/// on the tree head enforces this. Reads observe `read_revision`; staged
/// writes land at `write_revision = read_revision + 1` and become visible
/// only after [`commit`](LogTx::commit).
#[async_trait]
pub trait LogTx: ReadOnlyLogTx {
    fn tree_id(&self) -> TreeId;

    /// Revision staged writes will commit at.
    fn write_revision(&self) -> i64;

    /// Append leaves to the unsequenced queue.
    ///
    /// The returned vector is index-aligned with the input: `None` means the
    /// leaf was queued, `Some(existing)` means a leaf with the same identity
    /// hash already exists and nothing was inserted.
    async fn queue_leaves(
        &mut self,
        leaves: Vec<LogLeaf>,
        queue_timestamp_nanos: i64,
    ) -> Result<Vec<Option<LogLeaf>>>;

    /// Store leaves at client-chosen indices (preordered logs).
    async fn add_sequenced_leaves(
        &mut self,
        leaves: Vec<LogLeaf>,
        timestamp_nanos: i64,
    ) -> Result<Vec<QueuedLeaf>>;

    /// The earliest queued entries with `queue_timestamp <= cutoff`, up to
    /// `limit`. Entries stay queued until `update_sequenced_leaves` consumes
    /// them, so an aborted transaction redelivers.
    async fn dequeue_leaves(&mut self, limit: usize, cutoff_nanos: i64) -> Result<Vec<LogLeaf>>;

    /// Move leaves from the queue into the sequenced store at their assigned
    /// indices. A leaf without a matching queue entry aborts with an
    /// integrity error.
    async fn update_sequenced_leaves(&mut self, leaves: Vec<LogLeaf>) -> Result<()>;

    /// Stage internal node hashes at the write revision.
    async fn set_merkle_nodes(&mut self, nodes: Vec<TreeNode>) -> Result<()>;

    /// Stage the next signed root. The stored revision is always
    /// `write_revision`, regardless of what the body carries.
    async fn store_signed_log_root(&mut self, root: SignedLogRoot) -> Result<()>;

    /// Flush dirty subtrees, persist staged writes, release the lock.
    async fn commit(self: Box<Self>) -> Result<()>;
}

impl std::fmt::Debug for dyn LogTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn LogTx")
            .field("tree_id", &self.tree_id())
            .field("write_revision", &self.write_revision())
            .finish()
    }
}

/// Storage surface consumed by the RPC layer.
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Lightweight liveness probe of the backing store.
    async fn check_database_accessible(&self) -> Result<()>;

    /// IDs of all trees currently in a state that requires sequencing.
    async fn get_active_log_ids(&self) -> Result<Vec<TreeId>>;

    /// Open a read-only snapshot of the tree.
    async fn snapshot_for_tree(&self, tree: &TreeMeta) -> Result<Box<dyn ReadOnlyLogTx>>;

    /// Open a read-write transaction, acquiring the tree's write lock.
    ///
    /// Succeeds even when the tree has no root yet, so the caller can write
    /// the initial one; `latest_signed_log_root` reports `TreeNeedsInit`
    /// until then.
    async fn begin_for_tree(&self, tree: &TreeMeta) -> Result<Box<dyn LogTx>>;

    /// Queue leaves in a self-contained transaction and report per-leaf
    /// outcomes. Duplicate identity hashes surface the existing leaf with
    /// `AlreadyExists` instead of aborting the batch.
    async fn queue_leaves(
        &self,
        tree: &TreeMeta,
        leaves: Vec<LogLeaf>,
        queue_timestamp_nanos: i64,
    ) -> Result<Vec<QueuedLeaf>> {
        let mut tx = self.begin_for_tree(tree).await?;
        if let Err(e) = tx.latest_signed_log_root().await {
            let _ = tx.close().await;
            return Err(e);
        }
        let existing = match tx.queue_leaves(leaves.clone(), queue_timestamp_nanos).await {
            Ok(existing) => existing,
            Err(e) => {
                let _ = tx.close().await;
                return Err(e);
            }
        };
        tx.commit().await?;

        Ok(leaves
            .into_iter()
            .zip(existing)
            .map(|(leaf, dup)| match dup {
                Some(found) => QueuedLeaf::already_exists(found),
                None => QueuedLeaf::ok(leaf),
            })
            .collect())
    }

    /// Store client-sequenced leaves in a self-contained transaction.
    /// Only valid for preordered logs.
    async fn add_sequenced_leaves(
        &self,
        tree: &TreeMeta,
        leaves: Vec<LogLeaf>,
        timestamp_nanos: i64,
    ) -> Result<Vec<QueuedLeaf>> {
        if tree.tree_type != TreeType::PreorderedLog {
            return Err(StorageError::Unimplemented("AddSequencedLeaves"));
        }
        let mut tx = self.begin_for_tree(tree).await?;
        if let Err(e) = tx.latest_signed_log_root().await {
            let _ = tx.close().await;
            return Err(e);
        }
        let queued = match tx.add_sequenced_leaves(leaves, timestamp_nanos).await {
            Ok(queued) => queued,
            Err(e) => {
                let _ = tx.close().await;
                return Err(e);
            }
        };
        tx.commit().await?;
        Ok(queued)
    }
}

/// Opens a backing store and vends its storage instances.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// The log storage instance for this backing store.
    fn log_storage(&self) -> Arc<dyn LogStorage>;

    /// Probe the backing store.
    async fn check_database_accessible(&self) -> Result<()>;

    /// Quiesce pools. In-flight transactions either finish or fail with a
    /// retryable error.
    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn StorageProvider").finish()
    }
}

/// Consumed interface: immutable tree metadata from the admin subsystem.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdminReader: Send + Sync {
    async fn get_tree(&self, tree_id: TreeId) -> Result<TreeMeta>;

    async fn list_trees(&self) -> Result<Vec<TreeMeta>>;
}

/// Consumed interface: mastership signal for the sequencer.
///
/// The storage core trusts this signal and relies on the backing store's
/// tree-head lock to arbitrate the rare double-master window.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MasterSignal: Send + Sync {
    /// Whether this instance currently believes it is master for the tree.
    async fn is_master(&self, tree_id: TreeId) -> bool;

    /// Block until mastership is (believed to be) held. Best effort.
    async fn await_master(&self, tree_id: TreeId);
}

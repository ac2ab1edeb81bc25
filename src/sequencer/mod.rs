//! Batch integration: the canonical write path of a log tree.
//!
//! One integration cycle runs inside a single read-write transaction:
//! dequeue a batch, assign contiguous indices, fold the leaves into the
//! compact range, stage the new internal nodes, move the leaves into the
//! sequenced store, and store the next signed root. Preordered trees skip
//! the queue and integrate whatever contiguous prefix of client-sequenced
//! leaves is available.
//!
//! Root signing happens above storage; roots produced here carry an empty
//! signature for the layer above to replace before distribution.

use tracing::{debug, info, instrument};

use crate::crypto::LogHasher;
use crate::domain::{
    Hash, LogRoot, SignedLogRoot, TreeId, TreeMeta, TreeType,
};
use crate::infra::{
    AdminReader, LogStorage, LogTx, MasterSignal, Result, RetryConfig,
    StorageError,
};
use crate::merkle::CompactRange;

/// Tuning for one integration cycle.
#[derive(Debug, Clone)]
pub struct IntegrateOptions {
    /// Maximum leaves to integrate per cycle.
    pub batch_limit: usize,
    /// Leaves queued within this window before "now" are left for the next
    /// cycle, giving late-arriving duplicates time to dedup.
    pub guard_window_nanos: i64,
}

impl Default for IntegrateOptions {
    fn default() -> Self {
        Self {
            batch_limit: 1000,
            guard_window_nanos: 0,
        }
    }
}

/// Outcome of one integration cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationSummary {
    pub leaves_integrated: u64,
    pub tree_size: u64,
    pub root_hash: Hash,
    pub revision: i64,
}

/// Write the initial (empty) signed root if the tree has none yet.
///
/// Returns whether a root was written.
pub async fn init_tree<H: LogHasher>(
    storage: &dyn LogStorage,
    tree: &TreeMeta,
    hasher: &H,
    now_nanos: i64,
) -> Result<bool> {
    let mut tx = storage.begin_for_tree(tree).await?;
    match tx.latest_signed_log_root().await {
        Ok(_) => {
            tx.close().await?;
            Ok(false)
        }
        Err(StorageError::TreeNeedsInit(_)) => {
            let initial = SignedLogRoot::initial(hasher.empty_root(), now_nanos);
            if let Err(e) = tx.store_signed_log_root(initial).await {
                let _ = tx.close().await;
                return Err(e);
            }
            tx.commit().await?;
            info!(tree_id = %tree.id, "initialised empty log root");
            Ok(true)
        }
        Err(e) => {
            let _ = tx.close().await;
            Err(e)
        }
    }
}

/// Rebuild the compact range for the committed tree from stored nodes and
/// cross-check it against the signed root.
async fn load_range<H: LogHasher + Clone>(
    tx: &mut dyn LogTx,
    hasher: &H,
    root: &SignedLogRoot,
) -> Result<CompactRange<H>> {
    let tree_id = tx.tree_id();
    let size = root.tree_size();
    let ids = CompactRange::<H>::node_ids_for_size(size);
    let nodes = tx.get_merkle_nodes(&ids).await?;
    if nodes.len() != ids.len() {
        return Err(StorageError::Integrity {
            tree_id,
            message: format!(
                "tree of size {size} stores {} of {} fringe nodes",
                nodes.len(),
                ids.len()
            ),
        });
    }
    let range = CompactRange::from_parts(hasher.clone(), size, &nodes)
        .map_err(|e| StorageError::Integrity {
            tree_id,
            message: e.to_string(),
        })?;
    if range.root() != *root.root_hash() {
        return Err(StorageError::Integrity {
            tree_id,
            message: "stored subtrees do not reproduce the signed root hash".to_string(),
        });
    }
    Ok(range)
}

/// Integrate one batch of queued leaves (ordinary `LOG` trees).
///
/// A cycle with nothing to do stores no root and leaves the revision
/// unchanged; committing such a transaction is a no-op.
#[instrument(skip(tx, hasher, options), fields(tree_id = %tx.tree_id()))]
pub async fn integrate_batch<H: LogHasher + Clone>(
    tx: &mut dyn LogTx,
    hasher: &H,
    options: &IntegrateOptions,
    now_nanos: i64,
) -> Result<IntegrationSummary> {
    let root = tx.latest_signed_log_root().await?;
    let mut range = load_range(tx, hasher, &root).await?;
    let size = range.size();

    let cutoff = now_nanos - options.guard_window_nanos;
    let mut leaves = tx.dequeue_leaves(options.batch_limit, cutoff).await?;
    if leaves.is_empty() {
        debug!("no leaves ready for integration");
        return Ok(IntegrationSummary {
            leaves_integrated: 0,
            tree_size: size,
            root_hash: *root.root_hash(),
            revision: root.root.revision,
        });
    }

    for (offset, leaf) in leaves.iter_mut().enumerate() {
        leaf.leaf_index = size as i64 + offset as i64;
        leaf.integrate_timestamp_nanos = now_nanos;
        let new_nodes = range.append(leaf.merkle_leaf_hash);
        tx.set_merkle_nodes(new_nodes).await?;
    }

    let integrated = leaves.len() as u64;
    tx.update_sequenced_leaves(leaves).await?;

    let summary = store_new_root(tx, &range, now_nanos).await?;
    info!(
        leaves = integrated,
        tree_size = summary.tree_size,
        revision = summary.revision,
        "integrated batch"
    );
    Ok(IntegrationSummary {
        leaves_integrated: integrated,
        ..summary
    })
}

/// Integrate the contiguous prefix of client-sequenced leaves
/// (`PREORDERED_LOG` trees). A gap is not an error; integration simply
/// stops in front of it.
#[instrument(skip(tx, hasher, options), fields(tree_id = %tx.tree_id()))]
pub async fn integrate_preordered<H: LogHasher + Clone>(
    tx: &mut dyn LogTx,
    hasher: &H,
    options: &IntegrateOptions,
    now_nanos: i64,
) -> Result<IntegrationSummary> {
    let root = tx.latest_signed_log_root().await?;
    let mut range = load_range(tx, hasher, &root).await?;
    let size = range.size();

    let leaves = tx
        .get_leaves_by_range(size as i64, options.batch_limit as i64)
        .await?;
    if leaves.is_empty() {
        debug!("no contiguous leaves beyond the current tree size");
        return Ok(IntegrationSummary {
            leaves_integrated: 0,
            tree_size: size,
            root_hash: *root.root_hash(),
            revision: root.root.revision,
        });
    }

    for leaf in &leaves {
        let new_nodes = range.append(leaf.merkle_leaf_hash);
        tx.set_merkle_nodes(new_nodes).await?;
    }

    let summary = store_new_root(tx, &range, now_nanos).await?;
    info!(
        leaves = leaves.len(),
        tree_size = summary.tree_size,
        revision = summary.revision,
        "integrated preordered prefix"
    );
    Ok(IntegrationSummary {
        leaves_integrated: leaves.len() as u64,
        ..summary
    })
}

async fn store_new_root<H: LogHasher>(
    tx: &mut dyn LogTx,
    range: &CompactRange<H>,
    now_nanos: i64,
) -> Result<IntegrationSummary> {
    let revision = tx.write_revision();
    let root_hash = range.root();
    tx.store_signed_log_root(SignedLogRoot {
        root: LogRoot {
            tree_size: range.size(),
            root_hash,
            timestamp_nanos: now_nanos,
            revision,
        },
        signature: Vec::new(),
    })
    .await?;
    Ok(IntegrationSummary {
        leaves_integrated: 0,
        tree_size: range.size(),
        root_hash,
        revision,
    })
}

/// One guarded integration cycle: consult the master signal, look the tree
/// up, and run the type-appropriate integration inside a retried
/// read-write transaction.
///
/// Returns `None` when this instance is not master for the tree.
pub async fn run_once<H: LogHasher + Clone>(
    storage: &dyn LogStorage,
    admin: &dyn AdminReader,
    master: &dyn MasterSignal,
    tree_id: TreeId,
    hasher: &H,
    options: &IntegrateOptions,
    retry: &RetryConfig,
    now_nanos: i64,
) -> Result<Option<IntegrationSummary>> {
    if !master.is_master(tree_id).await {
        debug!(tree_id = %tree_id, "not master, skipping integration");
        return Ok(None);
    }
    let tree = admin.get_tree(tree_id).await?;

    let mut attempt = 0u32;
    loop {
        let mut tx = storage.begin_for_tree(&tree).await?;
        let outcome = match tree.tree_type {
            TreeType::Log => integrate_batch(&mut *tx, hasher, options, now_nanos).await,
            TreeType::PreorderedLog => {
                integrate_preordered(&mut *tx, hasher, options, now_nanos).await
            }
        };

        let failure = match outcome {
            Ok(summary) => match tx.commit().await {
                Ok(()) => return Ok(Some(summary)),
                Err(e) => e,
            },
            Err(e) => {
                let _ = tx.close().await;
                e
            }
        };

        if failure.is_retryable() && attempt < retry.max_retries {
            let delay = retry.delay_for_attempt(attempt);
            attempt += 1;
            tracing::warn!(
                tree_id = %tree_id,
                attempt,
                error = %failure,
                "integration cycle conflicted, retrying"
            );
            tokio::time::sleep(delay).await;
            continue;
        }
        return Err(failure);
    }
}

/// Result of sweeping every active tree once.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Trees that ran an integration cycle, with its summary.
    pub integrated: Vec<(TreeId, IntegrationSummary)>,
    /// Trees skipped because this instance is not their master.
    pub skipped: Vec<TreeId>,
    /// Trees whose cycle failed; failures are logged and do not stop the
    /// sweep, since trees are independent.
    pub failed: Vec<TreeId>,
}

/// Run one integration cycle for every active tree.
pub async fn run_all_once<H: LogHasher + Clone>(
    storage: &dyn LogStorage,
    admin: &dyn AdminReader,
    master: &dyn MasterSignal,
    hasher: &H,
    options: &IntegrateOptions,
    retry: &RetryConfig,
    now_nanos: i64,
) -> Result<SweepOutcome> {
    let mut outcome = SweepOutcome::default();
    for tree_id in storage.get_active_log_ids().await? {
        match run_once(
            storage, admin, master, tree_id, hasher, options, retry, now_nanos,
        )
        .await
        {
            Ok(Some(summary)) => outcome.integrated.push((tree_id, summary)),
            Ok(None) => outcome.skipped.push(tree_id),
            Err(e) => {
                tracing::error!(tree_id = %tree_id, error = %e, "integration cycle failed");
                outcome.failed.push(tree_id);
            }
        }
    }
    Ok(outcome)
}

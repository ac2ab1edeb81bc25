//! PostgreSQL log storage.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use std::sync::Arc;
use tracing::instrument;

use crate::domain::{
    Hash, LogLeaf, LogRoot, NodeId, QueuedLeaf, SignedLogRoot, SubtreeCoord, TreeId, TreeMeta,
    TreeNode, TreeType, UNSEQUENCED,
};
use crate::infra::cache::{Subtree, SubtreeCache};
use crate::infra::{LogStorage, LogTx, ReadOnlyLogTx, Result, StorageError};
use crate::metrics::StorageMetrics;

/// SQLSTATE for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

/// Named constraint for one-root-per-timestamp, used to tell a duplicate
/// root apart from a write-revision race.
const TREE_HEAD_TIMESTAMP_CONSTRAINT: &str = "uq_tree_head_timestamp";

/// PostgreSQL-backed log storage.
pub struct PgLogStorage {
    pool: PgPool,
    metrics: Arc<StorageMetrics>,
}

impl PgLogStorage {
    pub fn new(pool: PgPool, metrics: Arc<StorageMetrics>) -> Self {
        Self { pool, metrics }
    }

    async fn begin(&self, tree: &TreeMeta, readonly: bool) -> Result<PgLogTx> {
        let mut tx = self.pool.begin().await?;

        if !readonly {
            // Transaction-scoped advisory lock: the single writer per tree.
            // A concurrent writer blocks here until the holder commits or
            // rolls back.
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(tree.id.as_i64())
                .execute(&mut *tx)
                .await?;
        }

        let row: Option<(i64, Vec<u8>, Vec<u8>, i64, i64)> = sqlx::query_as(
            r#"
            SELECT tree_size, root_hash, root_signature, tree_revision, timestamp_nanos
            FROM tree_head
            WHERE tree_id = $1
            ORDER BY tree_revision DESC
            LIMIT 1
            "#,
        )
        .bind(tree.id.as_i64())
        .fetch_optional(&mut *tx)
        .await?;

        let root = row
            .map(|(tree_size, root_hash, signature, revision, timestamp_nanos)| {
                Ok::<SignedLogRoot, StorageError>(SignedLogRoot {
                    root: LogRoot {
                        tree_size: tree_size as u64,
                        root_hash: decode_hash(root_hash)?,
                        timestamp_nanos,
                        revision,
                    },
                    signature,
                })
            })
            .transpose()?;
        let read_rev = root.as_ref().map(|r| r.root.revision).unwrap_or(0);

        Ok(PgLogTx {
            tx,
            tree_id: tree.id,
            tree_type: tree.tree_type,
            readonly,
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
impl LogStorage for PgLogStorage {
    async fn check_database_accessible(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_active_log_ids(&self) -> Result<Vec<TreeId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM trees
            WHERE deleted = FALSE
              AND tree_type IN ('LOG', 'PREORDERED_LOG')
              AND tree_state IN ('ACTIVE', 'DRAINING')
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| TreeId(id)).collect())
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

/// A transaction over one PostgreSQL-backed tree.
struct PgLogTx {
    tx: Transaction<'static, Postgres>,
    tree_id: TreeId,
    tree_type: TreeType,
    readonly: bool,
    root: Option<SignedLogRoot>,
    read_rev: i64,
    write_rev: i64,
    cache: SubtreeCache,
    metrics: Arc<StorageMetrics>,
    pending_queued: u64,
    pending_dequeued: u64,
}

impl PgLogTx {
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(StorageError::Internal(
                "write operation on a read-only transaction".to_string(),
            ));
        }
        Ok(())
    }

    /// The stored leaf for an identity hash, wherever it currently lives:
    /// sequenced store first, queue otherwise.
    async fn leaf_by_identity(&mut self, identity_hash: &Hash) -> Result<Option<LogLeaf>> {
        let row: Option<(
            Vec<u8>,
            Vec<u8>,
            i64,
            Option<i64>,
            Option<i64>,
            Option<Vec<u8>>,
        )> = sqlx::query_as(
            r#"
            SELECT d.leaf_value, d.extra_data, d.queue_timestamp_nanos,
                   s.sequence_number, s.integrate_timestamp_nanos,
                   COALESCE(s.merkle_leaf_hash, u.merkle_leaf_hash)
            FROM leaf_data d
            LEFT JOIN sequenced_leaf_data s
              ON s.tree_id = d.tree_id AND s.leaf_identity_hash = d.leaf_identity_hash
            LEFT JOIN unsequenced u
              ON u.tree_id = d.tree_id AND u.leaf_identity_hash = d.leaf_identity_hash
            WHERE d.tree_id = $1 AND d.leaf_identity_hash = $2
            "#,
        )
        .bind(self.tree_id.as_i64())
        .bind(&identity_hash[..])
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(
            |(leaf_value, extra_data, queue_ts, sequence, integrate_ts, merkle)| {
                Ok(LogLeaf {
                    leaf_index: sequence.unwrap_or(UNSEQUENCED),
                    leaf_identity_hash: *identity_hash,
                    merkle_leaf_hash: decode_hash(merkle.unwrap_or_default())?,
                    leaf_value,
                    extra_data,
                    queue_timestamp_nanos: queue_ts,
                    integrate_timestamp_nanos: integrate_ts.unwrap_or(0),
                })
            },
        )
        .transpose()
    }

    async fn insert_leaf_data(&mut self, leaf: &LogLeaf, queue_timestamp_nanos: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO leaf_data (
                tree_id, leaf_identity_hash, leaf_value, extra_data, queue_timestamp_nanos
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tree_id, leaf_identity_hash) DO NOTHING
            "#,
        )
        .bind(self.tree_id.as_i64())
        .bind(&leaf.leaf_identity_hash[..])
        .bind(&leaf.leaf_value)
        .bind(&leaf.extra_data)
        .bind(queue_timestamp_nanos)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_sequenced_row(&mut self, leaf: &LogLeaf) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO sequenced_leaf_data (
                tree_id, sequence_number, leaf_identity_hash, merkle_leaf_hash,
                integrate_timestamp_nanos
            ) VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(self.tree_id.as_i64())
        .bind(leaf.leaf_index)
        .bind(&leaf.leaf_identity_hash[..])
        .bind(&leaf.merkle_leaf_hash[..])
        .bind(leaf.integrate_timestamp_nanos)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            // A sequence-number collision means the contiguity invariant
            // broke; surface it as corruption, not as a duplicate.
            Err(e) if is_unique_violation(&e) => Err(StorageError::Integrity {
                tree_id: self.tree_id,
                message: format!("leaf index {} written twice", leaf.leaf_index),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_subtrees(&mut self, coords: &[SubtreeCoord]) -> Result<()> {
        for coord in self.cache.missing(coords) {
            let row: Option<(Vec<u8>,)> = sqlx::query_as(
                r#"
                SELECT nodes
                FROM subtree
                WHERE tree_id = $1 AND subtree_id = $2 AND subtree_revision <= $3
                ORDER BY subtree_revision DESC
                LIMIT 1
                "#,
            )
            .bind(self.tree_id.as_i64())
            .bind(coord.to_key_bytes())
            .bind(self.read_rev)
            .fetch_optional(&mut *self.tx)
            .await?;

            let subtree = row.map(|(nodes,)| Subtree::from_bytes(&nodes)).transpose()?;
            self.cache.supply(coord, subtree);
        }
        Ok(())
    }
}

#[async_trait]
impl ReadOnlyLogTx for PgLogTx {
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
        let rows: Vec<(i64, Vec<u8>, Vec<u8>, i64, Vec<u8>, Vec<u8>, i64)> = sqlx::query_as(
            r#"
            SELECT s.sequence_number, s.leaf_identity_hash, s.merkle_leaf_hash,
                   s.integrate_timestamp_nanos,
                   d.leaf_value, d.extra_data, d.queue_timestamp_nanos
            FROM sequenced_leaf_data s
            JOIN leaf_data d
              ON d.tree_id = s.tree_id AND d.leaf_identity_hash = s.leaf_identity_hash
            WHERE s.tree_id = $1 AND s.sequence_number >= $2 AND s.sequence_number < $3
            ORDER BY s.sequence_number
            "#,
        )
        .bind(self.tree_id.as_i64())
        .bind(start)
        .bind(start.saturating_add(count))
        .fetch_all(&mut *self.tx)
        .await?;

        // Stop at the first gap; preordered trees may hold leaves past it.
        let mut leaves = Vec::with_capacity(rows.len());
        for (i, row) in rows.into_iter().enumerate() {
            if row.0 != start + i as i64 {
                break;
            }
            leaves.push(decode_leaf_row(row)?);
        }
        Ok(leaves)
    }

    async fn get_leaves_by_hash(
        &mut self,
        merkle_hashes: &[Hash],
        order_by_sequence: bool,
    ) -> Result<Vec<LogLeaf>> {
        let hashes: Vec<Vec<u8>> = merkle_hashes.iter().map(|h| h.to_vec()).collect();
        let sql = if order_by_sequence {
            r#"
            SELECT s.sequence_number, s.leaf_identity_hash, s.merkle_leaf_hash,
                   s.integrate_timestamp_nanos,
                   d.leaf_value, d.extra_data, d.queue_timestamp_nanos
            FROM sequenced_leaf_data s
            JOIN leaf_data d
              ON d.tree_id = s.tree_id AND d.leaf_identity_hash = s.leaf_identity_hash
            WHERE s.tree_id = $1 AND s.merkle_leaf_hash = ANY($2)
            ORDER BY s.sequence_number
            "#
        } else {
            r#"
            SELECT s.sequence_number, s.leaf_identity_hash, s.merkle_leaf_hash,
                   s.integrate_timestamp_nanos,
                   d.leaf_value, d.extra_data, d.queue_timestamp_nanos
            FROM sequenced_leaf_data s
            JOIN leaf_data d
              ON d.tree_id = s.tree_id AND d.leaf_identity_hash = s.leaf_identity_hash
            WHERE s.tree_id = $1 AND s.merkle_leaf_hash = ANY($2)
            "#
        };

        let rows: Vec<(i64, Vec<u8>, Vec<u8>, i64, Vec<u8>, Vec<u8>, i64)> = sqlx::query_as(sql)
            .bind(self.tree_id.as_i64())
            .bind(&hashes)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.into_iter().map(decode_leaf_row).collect()
    }

    async fn get_merkle_nodes(&mut self, ids: &[NodeId]) -> Result<Vec<TreeNode>> {
        let coords = self.cache.coords_for(ids);
        self.load_subtrees(&coords).await?;

        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(hash) = self.cache.get(*id)? {
                nodes.push(TreeNode { id: *id, hash });
            }
        }
        Ok(nodes)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl LogTx for PgLogTx {
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
        self.check_writable()?;
        let mut results = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let inserted = self.insert_leaf_data(&leaf, queue_timestamp_nanos).await?;
            if !inserted {
                let existing = self.leaf_by_identity(&leaf.leaf_identity_hash).await?;
                let existing = existing.ok_or_else(|| StorageError::Integrity {
                    tree_id: self.tree_id,
                    message: format!(
                        "leaf_data row for {} vanished mid-transaction",
                        hex::encode(leaf.leaf_identity_hash)
                    ),
                })?;
                results.push(Some(existing));
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO unsequenced (
                    tree_id, bucket, queue_timestamp_nanos, leaf_identity_hash, merkle_leaf_hash
                ) VALUES ($1, 0, $2, $3, $4)
                "#,
            )
            .bind(self.tree_id.as_i64())
            .bind(queue_timestamp_nanos)
            .bind(&leaf.leaf_identity_hash[..])
            .bind(&leaf.merkle_leaf_hash[..])
            .execute(&mut *self.tx)
            .await?;

            self.pending_queued += 1;
            results.push(None);
        }
        Ok(results)
    }

    async fn add_sequenced_leaves(
        &mut self,
        leaves: Vec<LogLeaf>,
        timestamp_nanos: i64,
    ) -> Result<Vec<QueuedLeaf>> {
        self.check_writable()?;
        if self.tree_type != TreeType::PreorderedLog {
            return Err(StorageError::Unimplemented("AddSequencedLeaves"));
        }
        let mut results = Vec::with_capacity(leaves.len());
        for mut leaf in leaves {
            if leaf.leaf_index < 0 {
                return Err(StorageError::InvalidArgument(format!(
                    "sequenced leaf must carry a non-negative index, got {}",
                    leaf.leaf_index
                )));
            }
            let inserted = self.insert_leaf_data(&leaf, timestamp_nanos).await?;
            if !inserted {
                let existing = self.leaf_by_identity(&leaf.leaf_identity_hash).await?;
                let existing = existing.ok_or_else(|| StorageError::Integrity {
                    tree_id: self.tree_id,
                    message: format!(
                        "leaf_data row for {} vanished mid-transaction",
                        hex::encode(leaf.leaf_identity_hash)
                    ),
                })?;
                results.push(QueuedLeaf::already_exists(existing));
                continue;
            }
            leaf.queue_timestamp_nanos = timestamp_nanos;
            leaf.integrate_timestamp_nanos = timestamp_nanos;
            self.insert_sequenced_row(&leaf).await?;
            results.push(QueuedLeaf::ok(leaf));
        }
        Ok(results)
    }

    async fn dequeue_leaves(&mut self, limit: usize, cutoff_nanos: i64) -> Result<Vec<LogLeaf>> {
        self.check_writable()?;
        let rows: Vec<(i64, Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT u.queue_timestamp_nanos, u.leaf_identity_hash, u.merkle_leaf_hash,
                   d.leaf_value, d.extra_data
            FROM unsequenced u
            JOIN leaf_data d
              ON d.tree_id = u.tree_id AND d.leaf_identity_hash = u.leaf_identity_hash
            WHERE u.tree_id = $1 AND u.bucket = 0 AND u.queue_timestamp_nanos <= $2
            ORDER BY u.queue_timestamp_nanos, u.leaf_identity_hash
            LIMIT $3
            "#,
        )
        .bind(self.tree_id.as_i64())
        .bind(cutoff_nanos)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut leaves = Vec::with_capacity(rows.len());
        for (queue_ts, identity, merkle, value, extra) in rows {
            leaves.push(LogLeaf {
                leaf_index: UNSEQUENCED,
                leaf_identity_hash: decode_hash(identity)?,
                merkle_leaf_hash: decode_hash(merkle)?,
                leaf_value: value,
                extra_data: extra,
                queue_timestamp_nanos: queue_ts,
                integrate_timestamp_nanos: 0,
            });
        }
        self.pending_dequeued += leaves.len() as u64;
        Ok(leaves)
    }

    async fn update_sequenced_leaves(&mut self, leaves: Vec<LogLeaf>) -> Result<()> {
        self.check_writable()?;
        for leaf in leaves {
            self.insert_sequenced_row(&leaf).await?;

            // One queue entry per sequenced leaf, matched by Merkle leaf
            // hash. Duplicate-content leaves each consume one entry.
            let removed = sqlx::query(
                r#"
                DELETE FROM unsequenced
                WHERE ctid IN (
                    SELECT ctid
                    FROM unsequenced
                    WHERE tree_id = $1 AND bucket = 0 AND merkle_leaf_hash = $2
                    ORDER BY queue_timestamp_nanos, leaf_identity_hash
                    LIMIT 1
                )
                "#,
            )
            .bind(self.tree_id.as_i64())
            .bind(&leaf.merkle_leaf_hash[..])
            .execute(&mut *self.tx)
            .await?;

            if removed.rows_affected() == 0 {
                return Err(StorageError::Integrity {
                    tree_id: self.tree_id,
                    message: format!(
                        "sequenced leaf {} has no queue entry with matching merkle hash",
                        hex::encode(leaf.merkle_leaf_hash)
                    ),
                });
            }
        }
        Ok(())
    }

    async fn set_merkle_nodes(&mut self, nodes: Vec<TreeNode>) -> Result<()> {
        self.check_writable()?;
        for node in nodes {
            self.cache.set(node);
        }
        Ok(())
    }

    async fn store_signed_log_root(&mut self, mut root: SignedLogRoot) -> Result<()> {
        self.check_writable()?;
        root.root.revision = self.write_rev;

        let result = sqlx::query(
            r#"
            INSERT INTO tree_head (
                tree_id, tree_size, root_hash, root_signature, tree_revision, timestamp_nanos
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(self.tree_id.as_i64())
        .bind(root.root.tree_size as i64)
        .bind(&root.root.root_hash[..])
        .bind(&root.signature)
        .bind(root.root.revision)
        .bind(root.root.timestamp_nanos)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if constraint_name(&e) == Some(TREE_HEAD_TIMESTAMP_CONSTRAINT) => {
                Err(StorageError::RootAlreadyExists {
                    tree_id: self.tree_id,
                    timestamp_nanos: root.root.timestamp_nanos,
                })
            }
            // A primary-key hit on (tree_id, tree_revision) means another
            // writer committed our revision first; the lock should prevent
            // this, but a lost lock is exactly the double-master race, and
            // it is safe to retry.
            Err(e) if is_unique_violation(&e) => Err(StorageError::Conflict {
                tree_id: self.tree_id,
                message: format!("tree head revision {} already committed", self.write_rev),
            }),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(tree_id = %self.tree_id, write_rev = self.write_rev))]
    async fn commit(mut self: Box<Self>) -> Result<()> {
        if self.cache.has_dirty() {
            let dirty = self.cache.dirty_coords();
            self.load_subtrees(&dirty).await?;
            let flushed = self.cache.flush()?;
            for (coord, subtree) in flushed {
                sqlx::query(
                    r#"
                    INSERT INTO subtree (tree_id, subtree_id, nodes, subtree_revision)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (tree_id, subtree_id, subtree_revision)
                    DO UPDATE SET nodes = EXCLUDED.nodes
                    "#,
                )
                .bind(self.tree_id.as_i64())
                .bind(coord.to_key_bytes())
                .bind(subtree.to_bytes())
                .bind(self.write_rev)
                .execute(&mut *self.tx)
                .await?;
            }
        }

        let this = *self;
        this.tx.commit().await?;
        this.metrics.add_queued(this.tree_id, this.pending_queued);
        this.metrics.add_dequeued(this.tree_id, this.pending_dequeued);
        Ok(())
    }
}

fn decode_hash(bytes: Vec<u8>) -> Result<Hash> {
    let got = bytes.len();
    bytes
        .try_into()
        .map_err(|_| StorageError::HashSizeMismatch { got, want: 32 })
}

type LeafRow = (i64, Vec<u8>, Vec<u8>, i64, Vec<u8>, Vec<u8>, i64);

fn decode_leaf_row(row: LeafRow) -> Result<LogLeaf> {
    let (sequence, identity, merkle, integrate_ts, value, extra, queue_ts) = row;
    Ok(LogLeaf {
        leaf_index: sequence,
        leaf_identity_hash: decode_hash(identity)?,
        merkle_leaf_hash: decode_hash(merkle)?,
        leaf_value: value,
        extra_data: extra,
        queue_timestamp_nanos: queue_ts,
        integrate_timestamp_nanos: integrate_ts,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}

fn constraint_name(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            db.constraint()
        }
        _ => None,
    }
}

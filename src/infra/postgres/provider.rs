//! PostgreSQL provider: pool lifecycle and tree metadata access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;

use crate::config::StorageOptions;
use crate::domain::{HashStrategy, TreeId, TreeMeta, TreeState, TreeType};
use crate::infra::{AdminReader, LogStorage, Result, StorageError, StorageProvider};
use crate::metrics::StorageMetrics;

use super::PgLogStorage;

/// Provider over one PostgreSQL pool.
pub struct PgStorageProvider {
    pool: PgPool,
    log: Arc<PgLogStorage>,
}

impl PgStorageProvider {
    /// Open a pool per the configured limits and wrap it.
    pub async fn open(options: &StorageOptions, metrics: Arc<StorageMetrics>) -> Result<Self> {
        options
            .validate()
            .map_err(StorageError::InvalidArgument)?;

        let mut pool_options = PgPoolOptions::new();
        if options.max_conns > 0 {
            pool_options = pool_options.max_connections(options.max_conns);
        }
        if options.max_idle_conns >= 0 {
            pool_options = pool_options.min_connections(options.max_idle_conns as u32);
        }
        if let Some(lifetime) = options.conn_max_lifetime() {
            pool_options = pool_options.max_lifetime(lifetime);
        }

        let pool = pool_options.connect(&options.uri).await?;
        Ok(Self::from_pool(pool, metrics))
    }

    /// Wrap an existing pool (tests, embedders with their own pooling).
    pub fn from_pool(pool: PgPool, metrics: Arc<StorageMetrics>) -> Self {
        let log = Arc::new(PgLogStorage::new(pool.clone(), metrics));
        Self { pool, log }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StorageProvider for PgStorageProvider {
    fn log_storage(&self) -> Arc<dyn LogStorage> {
        Arc::clone(&self.log) as Arc<dyn LogStorage>
    }

    async fn check_database_accessible(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Tree metadata read from the `trees` table.
pub struct PgAdmin {
    pool: PgPool,
}

impl PgAdmin {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a tree row. Tree CRUD proper belongs to the admin service;
    /// this exists for tests and bootstrap tooling.
    pub async fn create_tree(&self, meta: &TreeMeta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trees (
                id, tree_type, tree_state, hash_strategy, deleted, create_time, update_time
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(meta.id.as_i64())
        .bind(meta.tree_type.as_str())
        .bind(meta.state.as_str())
        .bind(meta.hash_strategy.as_str())
        .bind(meta.deleted)
        .bind(meta.create_time)
        .bind(meta.update_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

type TreeRow = (i64, String, String, String, bool, DateTime<Utc>, DateTime<Utc>);

fn decode_tree_row(row: TreeRow) -> Result<TreeMeta> {
    let (id, tree_type, state, strategy, deleted, create_time, update_time) = row;
    let tree_type = TreeType::from_str_opt(&tree_type)
        .ok_or_else(|| StorageError::Internal(format!("unknown tree type {tree_type:?}")))?;
    let state = TreeState::from_str_opt(&state)
        .ok_or_else(|| StorageError::Internal(format!("unknown tree state {state:?}")))?;
    let hash_strategy = HashStrategy::from_str_opt(&strategy)
        .ok_or_else(|| StorageError::Internal(format!("unknown hash strategy {strategy:?}")))?;
    Ok(TreeMeta {
        id: TreeId(id),
        tree_type,
        state,
        hash_strategy,
        deleted,
        create_time,
        update_time,
    })
}

#[async_trait]
impl AdminReader for PgAdmin {
    async fn get_tree(&self, tree_id: TreeId) -> Result<TreeMeta> {
        let row: Option<TreeRow> = sqlx::query_as(
            r#"
            SELECT id, tree_type, tree_state, hash_strategy, deleted, create_time, update_time
            FROM trees
            WHERE id = $1
            "#,
        )
        .bind(tree_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_tree_row)
            .transpose()?
            .ok_or(StorageError::TreeNotFound(tree_id))
    }

    async fn list_trees(&self) -> Result<Vec<TreeMeta>> {
        let rows: Vec<TreeRow> = sqlx::query_as(
            r#"
            SELECT id, tree_type, tree_state, hash_strategy, deleted, create_time, update_time
            FROM trees
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_tree_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_tree_row_rejects_unknown_enums() {
        let now = Utc::now();
        let good = (
            1i64,
            "LOG".to_string(),
            "ACTIVE".to_string(),
            "RFC6962_SHA256".to_string(),
            false,
            now,
            now,
        );
        let meta = decode_tree_row(good).unwrap();
        assert_eq!(meta.id, TreeId(1));
        assert_eq!(meta.tree_type, TreeType::Log);

        let bad = (
            1i64,
            "MAP".to_string(),
            "ACTIVE".to_string(),
            "RFC6962_SHA256".to_string(),
            false,
            now,
            now,
        );
        assert!(decode_tree_row(bad).is_err());
    }
}

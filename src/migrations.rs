//! Idempotent schema setup for the PostgreSQL backend.
//!
//! Mirrors the logical layout: `trees`, `tree_head`, `leaf_data`,
//! `sequenced_leaf_data`, `unsequenced`, `subtree`. Every statement is
//! `IF NOT EXISTS` so the runner can be invoked on every boot.

use sqlx::postgres::PgPool;

use crate::infra::Result;

/// Create all tables and indexes if they do not exist.
pub async fn run_postgres(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trees (
            id BIGINT PRIMARY KEY,
            tree_type VARCHAR(32) NOT NULL,
            tree_state VARCHAR(32) NOT NULL,
            hash_strategy VARCHAR(64) NOT NULL,
            deleted BOOLEAN NOT NULL DEFAULT FALSE,
            create_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            update_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            delete_time TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tree_head (
            tree_id BIGINT NOT NULL,
            tree_size BIGINT NOT NULL,
            root_hash BYTEA NOT NULL,
            root_signature BYTEA NOT NULL,
            tree_revision BIGINT NOT NULL,
            timestamp_nanos BIGINT NOT NULL,
            PRIMARY KEY (tree_id, tree_revision),
            CONSTRAINT uq_tree_head_timestamp UNIQUE (tree_id, timestamp_nanos)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leaf_data (
            tree_id BIGINT NOT NULL,
            leaf_identity_hash BYTEA NOT NULL,
            leaf_value BYTEA NOT NULL,
            extra_data BYTEA NOT NULL,
            queue_timestamp_nanos BIGINT NOT NULL,
            PRIMARY KEY (tree_id, leaf_identity_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sequenced_leaf_data (
            tree_id BIGINT NOT NULL,
            sequence_number BIGINT NOT NULL,
            leaf_identity_hash BYTEA NOT NULL,
            merkle_leaf_hash BYTEA NOT NULL,
            integrate_timestamp_nanos BIGINT NOT NULL,
            PRIMARY KEY (tree_id, sequence_number),
            CONSTRAINT uq_sequenced_leaf_identity UNIQUE (tree_id, leaf_identity_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sequenced_leaf_merkle_hash
         ON sequenced_leaf_data (tree_id, merkle_leaf_hash)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unsequenced (
            tree_id BIGINT NOT NULL,
            bucket INT NOT NULL DEFAULT 0,
            queue_timestamp_nanos BIGINT NOT NULL,
            leaf_identity_hash BYTEA NOT NULL,
            merkle_leaf_hash BYTEA NOT NULL,
            PRIMARY KEY (tree_id, bucket, queue_timestamp_nanos, leaf_identity_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_unsequenced_identity
         ON unsequenced (tree_id, leaf_identity_hash)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_unsequenced_merkle_hash
         ON unsequenced (tree_id, merkle_leaf_hash)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subtree (
            tree_id BIGINT NOT NULL,
            subtree_id BYTEA NOT NULL,
            nodes BYTEA NOT NULL,
            subtree_revision BIGINT NOT NULL,
            PRIMARY KEY (tree_id, subtree_id, subtree_revision)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Drop old subtree revisions, keeping everything a reader at or above
/// `keep_revision` could still need. Never touches a subtree's newest
/// revision.
pub async fn prune_subtrees_below(pool: &PgPool, tree_id: i64, keep_revision: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM subtree s
        WHERE s.tree_id = $1
          AND s.subtree_revision < $2
          AND EXISTS (
              SELECT 1 FROM subtree newer
              WHERE newer.tree_id = s.tree_id
                AND newer.subtree_id = s.subtree_id
                AND newer.subtree_revision > s.subtree_revision
                AND newer.subtree_revision <= $2
          )
        "#,
    )
    .bind(tree_id)
    .bind(keep_revision)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

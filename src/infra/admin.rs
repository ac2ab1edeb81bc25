//! In-memory tree metadata registry.
//!
//! Tree CRUD belongs to the admin subsystem; this registry is the minimal
//! [`AdminReader`] implementation used by tests and embedders of the
//! in-memory backend. The PostgreSQL backend reads the `trees` table
//! directly.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::{TreeId, TreeMeta};

use super::{AdminReader, Result, StorageError};

/// Registry of tree metadata held in memory.
#[derive(Default)]
pub struct MemoryAdmin {
    trees: RwLock<HashMap<TreeId, TreeMeta>>,
}

impl MemoryAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a tree's metadata.
    pub async fn upsert_tree(&self, meta: TreeMeta) {
        self.trees.write().await.insert(meta.id, meta);
    }
}

#[async_trait]
impl AdminReader for MemoryAdmin {
    async fn get_tree(&self, tree_id: TreeId) -> Result<TreeMeta> {
        self.trees
            .read()
            .await
            .get(&tree_id)
            .cloned()
            .ok_or(StorageError::TreeNotFound(tree_id))
    }

    async fn list_trees(&self) -> Result<Vec<TreeMeta>> {
        let mut trees: Vec<TreeMeta> = self.trees.read().await.values().cloned().collect();
        trees.sort_by_key(|t| t.id);
        Ok(trees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TreeType;

    #[tokio::test]
    async fn unknown_tree_is_not_found() {
        let admin = MemoryAdmin::new();
        let err = admin.get_tree(TreeId(404)).await.unwrap_err();
        assert!(matches!(err, StorageError::TreeNotFound(TreeId(404))));
    }

    #[tokio::test]
    async fn upsert_then_get_and_list() {
        let admin = MemoryAdmin::new();
        admin.upsert_tree(TreeMeta::new(TreeId(2), TreeType::Log)).await;
        admin
            .upsert_tree(TreeMeta::new(TreeId(1), TreeType::PreorderedLog))
            .await;

        let got = admin.get_tree(TreeId(2)).await.unwrap();
        assert_eq!(got.id, TreeId(2));

        let all = admin.list_trees().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, TreeId(1));
    }
}

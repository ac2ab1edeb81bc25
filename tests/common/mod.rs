//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use merklelog::crypto::Rfc6962Hasher;
use merklelog::domain::{LogLeaf, TreeId, TreeMeta, TreeType};
use merklelog::infra::memory::{MemoryLogStorage, MemoryTreeStore};
use merklelog::metrics::StorageMetrics;

/// A memory-backed storage stack for one test.
pub struct Harness {
    pub store: Arc<MemoryTreeStore>,
    pub storage: Arc<MemoryLogStorage>,
    pub metrics: Arc<StorageMetrics>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryTreeStore::new());
        let metrics = Arc::new(StorageMetrics::default());
        let storage = Arc::new(MemoryLogStorage::new(
            Arc::clone(&store),
            Arc::clone(&metrics),
        ));
        Self {
            store,
            storage,
            metrics,
        }
    }

    /// Register an ordinary log tree and return its metadata.
    pub fn add_log_tree(&self, id: i64) -> TreeMeta {
        let meta = TreeMeta::new(TreeId(id), TreeType::Log);
        self.store.add_tree(meta.clone()).unwrap();
        meta
    }

    /// Register a preordered log tree and return its metadata.
    pub fn add_preordered_tree(&self, id: i64) -> TreeMeta {
        let meta = TreeMeta::new(TreeId(id), TreeType::PreorderedLog);
        self.store.add_tree(meta.clone()).unwrap();
        meta
    }
}

/// A leaf whose identity and Merkle hashes derive from `value`.
pub fn leaf(value: &str) -> LogLeaf {
    LogLeaf::new(&Rfc6962Hasher, value.as_bytes().to_vec(), Vec::new())
}

/// A leaf with separate extra data.
pub fn leaf_with_extra(value: &str, extra: &str) -> LogLeaf {
    LogLeaf::new(
        &Rfc6962Hasher,
        value.as_bytes().to_vec(),
        extra.as_bytes().to_vec(),
    )
}

//! Metrics for the storage core.
//!
//! A small label-aware counter registry. Transactions stage their
//! increments and apply them at commit, so counters never drift under
//! retry or rollback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::domain::TreeId;

const TREE_ID_LABEL: &str = "tree_id";

/// Label set for dimensional metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.push((key.to_string(), value.to_string()));
        self
    }

    pub fn tree(self, tree_id: TreeId) -> Self {
        self.with(TREE_ID_LABEL, &tree_id.to_string())
    }
}

impl Default for Labels {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of labeled counters.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, HashMap<Labels, Arc<AtomicU64>>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to a labeled counter, creating it on first use.
    pub fn add(&self, name: &str, labels: Labels, delta: u64) {
        if let Some(counter) = self
            .counters
            .read()
            .expect("metrics lock poisoned")
            .get(name)
            .and_then(|by_label| by_label.get(&labels))
        {
            counter.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        let mut counters = self.counters.write().expect("metrics lock poisoned");
        counters
            .entry(name.to_string())
            .or_default()
            .entry(labels)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value of a labeled counter; 0 if never written.
    pub fn value(&self, name: &str, labels: &Labels) -> u64 {
        self.counters
            .read()
            .expect("metrics lock poisoned")
            .get(name)
            .and_then(|by_label| by_label.get(labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// The storage core's counters.
pub struct StorageMetrics {
    registry: Arc<MetricsRegistry>,
}

impl StorageMetrics {
    pub const QUEUED_LEAVES: &'static str = "queued_leaves";
    pub const DEQUEUED_LEAVES: &'static str = "dequeued_leaves";

    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn add_queued(&self, tree_id: TreeId, count: u64) {
        if count > 0 {
            self.registry
                .add(Self::QUEUED_LEAVES, Labels::new().tree(tree_id), count);
        }
    }

    pub fn add_dequeued(&self, tree_id: TreeId, count: u64) {
        if count > 0 {
            self.registry
                .add(Self::DEQUEUED_LEAVES, Labels::new().tree(tree_id), count);
        }
    }

    pub fn queued(&self, tree_id: TreeId) -> u64 {
        self.registry
            .value(Self::QUEUED_LEAVES, &Labels::new().tree(tree_id))
    }

    pub fn dequeued(&self, tree_id: TreeId) -> u64 {
        self.registry
            .value(Self::DEQUEUED_LEAVES, &Labels::new().tree(tree_id))
    }
}

impl Default for StorageMetrics {
    fn default() -> Self {
        Self::new(Arc::new(MetricsRegistry::new()))
    }
}

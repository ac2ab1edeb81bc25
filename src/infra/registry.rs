//! Storage provider registry.
//!
//! An explicit registry object rather than process-global state: the server
//! builds one at startup, tests build their own.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StorageOptions;
use crate::metrics::StorageMetrics;

use super::memory::MemoryStorageProvider;
use super::postgres::PgStorageProvider;
use super::{Result, StorageError, StorageProvider};

/// Builds a [`StorageProvider`] for one named storage system.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn open(
        &self,
        options: &StorageOptions,
        metrics: Arc<StorageMetrics>,
    ) -> Result<Arc<dyn StorageProvider>>;
}

/// Named provider factories.
pub struct StorageRegistry {
    factories: HashMap<String, Arc<dyn ProviderFactory>>,
}

impl StorageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in providers registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("memory", Arc::new(MemoryFactory));
        registry.register("postgresql", Arc::new(PostgresFactory));
        // CockroachDB speaks the PostgreSQL wire protocol; serialization
        // failures surface as SQLSTATE 40001 and flow through the same
        // retry classification.
        registry.register("cockroachdb", Arc::new(PostgresFactory));
        registry
    }

    /// Register a factory under a provider name, replacing any previous one.
    pub fn register(&mut self, name: &str, factory: Arc<dyn ProviderFactory>) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Names of all registered providers.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Open the provider selected by `options.storage_system`.
    pub async fn open(
        &self,
        options: &StorageOptions,
        metrics: Arc<StorageMetrics>,
    ) -> Result<Arc<dyn StorageProvider>> {
        let factory = self.factories.get(&options.storage_system).ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "unknown storage system {:?}; registered: {:?}",
                options.storage_system,
                self.providers()
            ))
        })?;
        factory.open(options, metrics).await
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

struct MemoryFactory;

#[async_trait]
impl ProviderFactory for MemoryFactory {
    async fn open(
        &self,
        _options: &StorageOptions,
        metrics: Arc<StorageMetrics>,
    ) -> Result<Arc<dyn StorageProvider>> {
        Ok(Arc::new(MemoryStorageProvider::new(metrics)))
    }
}

struct PostgresFactory;

#[async_trait]
impl ProviderFactory for PostgresFactory {
    async fn open(
        &self,
        options: &StorageOptions,
        metrics: Arc<StorageMetrics>,
    ) -> Result<Arc<dyn StorageProvider>> {
        Ok(Arc::new(PgStorageProvider::open(options, metrics).await?))
    }
}

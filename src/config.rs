//! Storage configuration.

use std::time::Duration;

/// Options for opening a backing store.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Backing-store connection URI. Ignored by the in-memory provider.
    pub uri: String,
    /// Maximum open connections; 0 leaves the driver default.
    pub max_conns: u32,
    /// Maximum idle connections; -1 leaves the driver default, 0 disables
    /// idle pooling.
    pub max_idle_conns: i32,
    /// Reaping threshold for pooled connections; 0 disables reaping.
    pub conn_max_lifetime_seconds: u64,
    /// Registered provider name (`memory`, `postgresql`, ...).
    pub storage_system: String,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            uri: String::new(),
            max_conns: 0,
            max_idle_conns: -1,
            conn_max_lifetime_seconds: 0,
            storage_system: "memory".to_string(),
        }
    }
}

impl StorageOptions {
    /// Load options from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let uri = std::env::var("STORAGE_URI").unwrap_or(defaults.uri);

        let max_conns = std::env::var("STORAGE_MAX_CONNS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_conns);

        let max_idle_conns = std::env::var("STORAGE_MAX_IDLE_CONNS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_idle_conns);

        let conn_max_lifetime_seconds = std::env::var("STORAGE_CONN_MAX_LIFETIME_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.conn_max_lifetime_seconds);

        let storage_system =
            std::env::var("STORAGE_SYSTEM").unwrap_or(defaults.storage_system);

        Self {
            uri,
            max_conns,
            max_idle_conns,
            conn_max_lifetime_seconds,
            storage_system,
        }
    }

    /// Connection lifetime as a [`Duration`], if reaping is enabled.
    pub fn conn_max_lifetime(&self) -> Option<Duration> {
        (self.conn_max_lifetime_seconds > 0)
            .then(|| Duration::from_secs(self.conn_max_lifetime_seconds))
    }

    /// Validate option ranges.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_idle_conns < -1 {
            return Err(format!(
                "max_idle_conns must be >= -1, got {}",
                self.max_idle_conns
            ));
        }
        if self.storage_system.is_empty() {
            return Err("storage_system must not be empty".to_string());
        }
        Ok(())
    }
}

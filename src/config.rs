//! Configuration Module
//!
//! Store construction settings, plus loading the sweeper's configuration from
//! environment variables.

use std::env;
use std::path::PathBuf;

use crate::cache::{DEFAULT_DURABLE_CACHE_SIZE, DEFAULT_MEMORY_CACHE_SIZE};

/// Directory name used under the platform cache directory
const DEFAULT_STORAGE_DIR: &str = "expiry_cache";

/// Settings for a [`MemoryStore`](crate::cache::MemoryStore).
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Capacity ceiling in bytes that triggers eviction
    pub max_size_bytes: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MEMORY_CACHE_SIZE,
        }
    }
}

/// Settings for a [`DurableStore`](crate::cache::DurableStore).
#[derive(Debug, Clone)]
pub struct DurableStoreConfig {
    /// Directory holding payload and sidecar files, created if absent
    pub storage_path: PathBuf,
    /// Capacity ceiling in bytes that triggers eviction
    pub max_size_bytes: u64,
    /// Names the store's worker; does not affect file paths
    pub namespace: String,
}

impl DurableStoreConfig {
    /// Default capacity and namespace at `storage_path`.
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            max_size_bytes: DEFAULT_DURABLE_CACHE_SIZE,
            namespace: "default".to_string(),
        }
    }

    /// Sets the capacity above which the store prunes.
    ///
    /// # Arguments
    /// * `max_size_bytes` - Capacity ceiling in bytes
    pub fn with_max_size(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }

    /// Sets the namespace the worker thread is named after.
    ///
    /// # Arguments
    /// * `namespace` - Short identifier, e.g. `"thumbnails"`
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Thread name of the store's serial worker.
    pub fn worker_name(&self) -> String {
        format!("expiry-cache.{}", self.namespace)
    }
}

impl Default for DurableStoreConfig {
    /// Default capacity and namespace under the platform cache directory.
    fn default() -> Self {
        Self::new(default_storage_path())
    }
}

/// `<platform cache dir>/expiry_cache`, or under the temp dir when the
/// platform has no cache directory.
pub fn default_storage_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join(DEFAULT_STORAGE_DIR)
}

/// Sweeper configuration.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// The durable store to maintain
    pub store: DurableStoreConfig,
    /// Expiry sweep frequency in seconds
    pub sweep_interval: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_STORAGE_PATH` - Storage directory (default: `<cache dir>/expiry_cache`)
    /// - `CACHE_MAX_BYTES` - Capacity in bytes (default: 250 MiB)
    /// - `CACHE_NAMESPACE` - Worker namespace (default: `default`)
    /// - `SWEEP_INTERVAL` - Sweep frequency in seconds (default: 60)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let storage_path = env::var("CACHE_STORAGE_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.store.storage_path);

        Self {
            store: DurableStoreConfig {
                storage_path,
                max_size_bytes: env::var("CACHE_MAX_BYTES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.store.max_size_bytes),
                namespace: env::var("CACHE_NAMESPACE")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or(defaults.store.namespace),
            },
            sweep_interval: env::var("SWEEP_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.sweep_interval),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: DurableStoreConfig::default(),
            sweep_interval: 60,
        }
    }
}

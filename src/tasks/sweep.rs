//! Expiry Sweep Task
//!
//! Background task that periodically removes expired cache entries from any
//! store.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::Cache;

/// Spawns a background task that periodically sweeps expired entries.
///
/// Reads never evict, so without a sweep expired entries keep counting
/// towards the store's size until the next prune.
///
/// # Arguments
/// * `cache` - The store to sweep
/// * `interval_secs` - Interval in seconds between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let cache: Arc<dyn Cache> = Arc::new(MemoryStore::default());
/// let sweep_handle = spawn_sweep_task(cache.clone(), 60);
/// // Later, during shutdown:
/// sweep_handle.abort();
/// ```
pub fn spawn_sweep_task(cache: Arc<dyn Cache>, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs);

    tokio::spawn(async move {
        info!(interval_secs, "Starting expiry sweep task");

        loop {
            tokio::time::sleep(interval).await;

            match cache.remove_all_expired().await {
                Ok(0) => debug!("Expiry sweep: no expired entries found"),
                Ok(removed) => info!(
                    removed,
                    size_bytes = cache.size_in_bytes(),
                    "Expiry sweep: removed expired entries"
                ),
                Err(e) => warn!(error = %e, "Expiry sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::config::MemoryStoreConfig;

    fn memory_cache() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(MemoryStoreConfig::default()))
    }

    #[tokio::test]
    async fn test_sweep_task_removes_expired_entries() {
        let store = memory_cache();
        store.store(vec![0; 100], "expire_soon", "", Duration::from_secs(1));
        store.store(vec![0; 50], "long_lived", "", Duration::from_secs(3600));

        let handle = spawn_sweep_task(store.clone(), 1);

        // Wait for entry to expire and a sweep to run
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(!store.exists("expire_soon", ""));
        assert!(store.exists("long_lived", ""));
        assert_eq!(store.size_in_bytes(), 50);
        assert_eq!(store.stats().expirations, 1);

        handle.abort();
    }

    #[tokio::test]
    async fn test_sweep_task_can_be_aborted() {
        let handle = spawn_sweep_task(memory_cache(), 1);

        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}

//! Cache Module
//!
//! Bounded, expiring byte caches with a shared capability surface. Two
//! backends are provided: [`MemoryStore`] keeps payloads in process memory,
//! [`DurableStore`] keeps them on disk with sidecar metadata files.

mod durable;
mod entry;
mod key;
mod memory;
mod stats;
mod ticket;


use std::time::Duration;

use serde::Serialize;

// Re-export public types
pub use durable::DurableStore;
pub use entry::CacheEntry;
pub use key::{group_prefix, CacheKey};
pub use memory::MemoryStore;
pub use stats::CacheStats;
pub use ticket::Ticket;

// == Public Constants ==
/// Default capacity of a memory store
pub const DEFAULT_MEMORY_CACHE_SIZE: u64 = 100 * 1024 * 1024; // 100 MiB

/// Default capacity of a durable store
pub const DEFAULT_DURABLE_CACHE_SIZE: u64 = 250 * 1024 * 1024; // 250 MiB

// == Cache Capability ==
/// Operations every store supports, regardless of backend.
///
/// An empty `group` addresses ungrouped entries. A zero `ttl` stores an entry
/// that never expires. Absent and expired entries are reported as `None` or
/// `false`, never as errors.
pub trait Cache: Send + Sync {
    /// Stores `payload`, replacing any previous entry for the same key.
    fn store(&self, payload: Vec<u8>, key: &str, group: &str, ttl: Duration) -> Ticket<()>;

    /// Whether a non-expired entry exists. Answers synchronously.
    fn exists(&self, key: &str, group: &str) -> bool;

    /// Returns the payload of a non-expired entry.
    fn fetch(&self, key: &str, group: &str) -> Ticket<Option<Vec<u8>>>;

    /// Removes an entry. Resolves to whether anything was removed.
    fn remove(&self, key: &str, group: &str) -> Ticket<bool>;

    /// Removes every entry of `group`. Resolves to the number removed.
    fn remove_all_in_group(&self, group: &str) -> Ticket<usize>;

    /// Removes every expired entry. Resolves to the number removed.
    fn remove_all_expired(&self) -> Ticket<usize>;

    /// Removes everything.
    fn clear(&self) -> Ticket<()>;

    /// Resolves once all previously submitted work, including any prune it
    /// triggered, has finished.
    fn flush(&self) -> Ticket<()>;

    /// Currently tracked size in bytes.
    fn size_in_bytes(&self) -> u64;

    /// Capacity above which a prune runs.
    fn max_size_in_bytes(&self) -> u64;

    /// Hit, miss, eviction and expiration counters plus current occupancy.
    fn stats(&self) -> CacheStats;
}

// == Eviction Report ==
/// Outcome of a prune pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Entries removed because they had expired
    pub expired: usize,
    /// Entries removed to get back under capacity
    pub evicted: usize,
    /// Total bytes released
    pub bytes_freed: u64,
    /// Tracked size before the pass
    pub size_before: u64,
    /// Tracked size after the pass
    pub size_after: u64,
}

impl EvictionReport {
    /// Whether the pass removed anything.
    pub fn removed_any(&self) -> bool {
        self.expired + self.evicted > 0
    }
}

/// Size a prune drives the store down to.
pub(crate) fn prune_target(max_size_bytes: u64) -> u64 {
    max_size_bytes / 2
}

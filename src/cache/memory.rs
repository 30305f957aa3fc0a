//! Memory Store Module
//!
//! Process-lifetime byte cache with size accounting, TTL expiration and
//! earliest-expiry-first eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::cache::{
    group_prefix, prune_target, Cache, CacheEntry, CacheKey, CacheStats, EvictionReport, Ticket,
};
use crate::clock::{Clock, SystemClock};
use crate::config::MemoryStoreConfig;
use crate::error::Result;

// == Memory Store ==
/// In-memory cache guarded by a single mutex.
///
/// Every read and write of the entry map, the size counter and the stats
/// goes through the same lock. No I/O happens while it is held.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    max_size_bytes: u64,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Entries by normalized (key, group)
    entries: HashMap<CacheKey, CacheEntry>,
    /// Sum of `size_bytes` over `entries`
    size_bytes: u64,
    next_sequence: u64,
    stats: CacheStats,
}

impl MemoryStore {
    // == Constructor ==
    /// Creates an empty store on the system clock.
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates an empty store reading time from `clock`.
    pub fn with_clock(config: MemoryStoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_size_bytes: config.max_size_bytes,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // == Store ==
    /// Stores `payload` under `(key, group)` for `ttl`.
    ///
    /// Replaces any entry with the same composite key. If the store is then
    /// over capacity, a prune runs before this returns. Returns false only
    /// for a malformed key.
    pub fn store(&self, payload: Vec<u8>, key: &str, group: &str, ttl: Duration) -> bool {
        self.try_store(payload, key, group, ttl).is_ok()
    }

    fn try_store(&self, payload: Vec<u8>, key: &str, group: &str, ttl: Duration) -> Result<()> {
        let key = CacheKey::parse(key, group)?;
        let now = self.clock.now();

        let mut inner = self.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let entry = CacheEntry::new(key, payload, ttl, now, sequence);
        debug!(key = %entry.key, size_bytes = entry.size_bytes, "Storing entry in memory");
        inner.insert(entry);

        if inner.size_bytes > self.max_size_bytes {
            let report = inner.prune(now, self.max_size_bytes);
            log_prune(&report);
        }

        Ok(())
    }

    // == Exists ==
    /// Whether a non-expired entry exists. Does not remove expired entries.
    pub fn exists(&self, key: &str, group: &str) -> bool {
        let key = CacheKey::new(key, group);
        let now = self.clock.now();

        self.lock()
            .entries
            .get(&key)
            .is_some_and(|entry| !entry.is_expired_at(now))
    }

    // == Fetch ==
    /// Returns a copy of the payload if present and not expired.
    pub fn fetch(&self, key: &str, group: &str) -> Option<Vec<u8>> {
        let key = CacheKey::new(key, group);
        let now = self.clock.now();

        let mut inner = self.lock();
        let payload = inner
            .entries
            .get(&key)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.payload.clone());

        match payload {
            Some(_) => inner.stats.record_hit(),
            None => inner.stats.record_miss(),
        }
        payload
    }

    // == Remove ==
    /// Removes the entry if present. Returns whether anything was removed.
    pub fn remove(&self, key: &str, group: &str) -> bool {
        self.lock().remove(&CacheKey::new(key, group)).is_some()
    }

    // == Remove Group ==
    /// Removes every entry stored under `group`; an empty group targets
    /// ungrouped entries. Returns the number removed.
    pub fn remove_all_in_group(&self, group: &str) -> usize {
        let mut inner = self.lock();
        let doomed: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|key| key.in_group(group))
            .cloned()
            .collect();

        for key in &doomed {
            inner.remove(key);
        }

        debug!(prefix = %group_prefix(group), removed = doomed.len(), "Removed group from memory");
        doomed.len()
    }

    // == Remove Expired ==
    /// Removes every expired entry. Returns the number removed.
    pub fn remove_all_expired(&self) -> usize {
        let now = self.clock.now();
        let (removed, _) = self.lock().remove_expired(now);
        removed
    }

    // == Prune ==
    /// Drops expired entries, then evicts earliest-expiring entries until the
    /// store is at or under half its capacity.
    pub fn prune(&self) -> EvictionReport {
        let now = self.clock.now();
        let report = self.lock().prune(now, self.max_size_bytes);
        log_prune(&report);
        report
    }

    /// Removes everything.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.size_bytes = 0;
    }

    /// Sum of the payload sizes currently held, expired entries included
    /// until a sweep or prune removes them.
    pub fn size_in_bytes(&self) -> u64 {
        self.lock().size_bytes
    }

    /// Capacity above which a store triggers a prune.
    pub fn max_size_in_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Number of entries held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// (tracked size, sum of entry sizes); equal whenever no call is in flight.
    #[cfg(test)]
    pub(crate) fn accounted_size(&self) -> (u64, u64) {
        let inner = self.lock();
        let summed = inner.entries.values().map(|e| e.size_bytes).sum();
        (inner.size_bytes, summed)
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let mut stats = inner.stats.clone();
        stats.set_occupancy(inner.entries.len(), inner.size_bytes);
        stats
    }
}

impl Inner {
    fn insert(&mut self, entry: CacheEntry) {
        let added = entry.size_bytes;
        if let Some(previous) = self.entries.insert(entry.key.clone(), entry) {
            self.size_bytes -= previous.size_bytes;
        }
        self.size_bytes += added;
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.size_bytes -= entry.size_bytes;
        Some(entry)
    }

    /// Returns (entries removed, bytes freed).
    fn remove_expired(&mut self, now: DateTime<Utc>) -> (usize, u64) {
        let expired: Vec<CacheKey> = self
            .entries
            .values()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect();

        let freed = expired
            .iter()
            .filter_map(|key| self.remove(key))
            .map(|entry| entry.size_bytes)
            .sum();

        self.stats.record_expirations(expired.len());
        (expired.len(), freed)
    }

    fn prune(&mut self, now: DateTime<Utc>, max_size_bytes: u64) -> EvictionReport {
        let size_before = self.size_bytes;
        let (expired, mut bytes_freed) = self.remove_expired(now);
        let mut evicted = 0;

        if self.size_bytes > max_size_bytes {
            let target = prune_target(max_size_bytes);

            // Earliest expiry first, never-expiring last, insertion order on ties.
            let mut order: Vec<(Option<DateTime<Utc>>, u64, CacheKey)> = self
                .entries
                .values()
                .map(|entry| (entry.expires_at, entry.sequence, entry.key.clone()))
                .collect();
            order.sort_by(|a, b| {
                let by_expiry = match (a.0, b.0) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                by_expiry.then(a.1.cmp(&b.1))
            });

            for (_, _, key) in order {
                if self.size_bytes <= target {
                    break;
                }
                if let Some(entry) = self.remove(&key) {
                    bytes_freed += entry.size_bytes;
                    evicted += 1;
                }
            }
            self.stats.record_evictions(evicted);
        }

        EvictionReport {
            expired,
            evicted,
            bytes_freed,
            size_before,
            size_after: self.size_bytes,
        }
    }
}

fn log_prune(report: &EvictionReport) {
    if report.removed_any() {
        info!(
            expired = report.expired,
            evicted = report.evicted,
            bytes_freed = report.bytes_freed,
            size_after = report.size_after,
            "Pruned memory cache"
        );
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl Cache for MemoryStore {
    fn store(&self, payload: Vec<u8>, key: &str, group: &str, ttl: Duration) -> Ticket<()> {
        Ticket::ready(self.try_store(payload, key, group, ttl))
    }

    fn exists(&self, key: &str, group: &str) -> bool {
        MemoryStore::exists(self, key, group)
    }

    fn fetch(&self, key: &str, group: &str) -> Ticket<Option<Vec<u8>>> {
        Ticket::ready(Ok(MemoryStore::fetch(self, key, group)))
    }

    fn remove(&self, key: &str, group: &str) -> Ticket<bool> {
        Ticket::ready(Ok(MemoryStore::remove(self, key, group)))
    }

    fn remove_all_in_group(&self, group: &str) -> Ticket<usize> {
        Ticket::ready(Ok(MemoryStore::remove_all_in_group(self, group)))
    }

    fn remove_all_expired(&self) -> Ticket<usize> {
        Ticket::ready(Ok(MemoryStore::remove_all_expired(self)))
    }

    fn clear(&self) -> Ticket<()> {
        MemoryStore::clear(self);
        Ticket::ready(Ok(()))
    }

    fn flush(&self) -> Ticket<()> {
        Ticket::ready(Ok(()))
    }

    fn size_in_bytes(&self) -> u64 {
        MemoryStore::size_in_bytes(self)
    }

    fn max_size_in_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    fn stats(&self) -> CacheStats {
        MemoryStore::stats(self)
    }
}

//! Cache Statistics Module
//!
//! Tracks cache metrics including hits, misses, evictions and expirations.

use serde::Serialize;

// == Cache Stats ==
/// Counters and current occupancy of a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Fetches that returned a payload
    pub hits: u64,
    /// Fetches that found nothing (absent or expired)
    pub misses: u64,
    /// Entries removed by capacity pruning
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Current number of entries
    pub total_entries: usize,
    /// Current tracked size in bytes
    pub size_bytes: u64,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no fetches have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Records a fetch that found a live entry.
    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    /// Records a fetch that found nothing, or only an expired entry.
    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    /// Records `count` capacity evictions.
    pub fn record_evictions(&mut self, count: usize) {
        self.evictions += count as u64;
    }

    /// Records `count` expiry removals.
    pub fn record_expirations(&mut self, count: usize) {
        self.expirations += count as u64;
    }

    // == Update Occupancy ==
    /// Overwrites the entry count and size snapshot.
    pub fn set_occupancy(&mut self, total_entries: usize, size_bytes: u64) {
        self.total_entries = total_entries;
        self.size_bytes = size_bytes;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = CacheStats::new();
        assert_eq!(stats, CacheStats::default());
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_hit_rate_no_requests() {
        let stats = CacheStats::new();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let mut stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_record_removals() {
        let mut stats = CacheStats::new();
        stats.record_evictions(3);
        stats.record_expirations(2);
        stats.record_evictions(1);
        assert_eq!(stats.evictions, 4);
        assert_eq!(stats.expirations, 2);
    }

    #[test]
    fn test_set_occupancy() {
        let mut stats = CacheStats::new();
        stats.set_occupancy(42, 4096);
        assert_eq!(stats.total_entries, 42);
        assert_eq!(stats.size_bytes, 4096);
    }

    #[test]
    fn test_stats_serialize() {
        let mut stats = CacheStats::new();
        stats.record_hit();
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["hits"], 1);
        assert_eq!(json["size_bytes"], 0);
    }
}

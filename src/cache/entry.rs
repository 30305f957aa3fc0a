//! Cache Entry Module
//!
//! Defines the record kept for each stored payload, with TTL support.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::CacheKey;
use crate::clock::to_chrono;

// == Cache Entry ==
/// A stored payload and its accounting metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Normalized key and group
    pub key: CacheKey,
    /// The stored bytes, never interpreted
    pub payload: Vec<u8>,
    /// Byte length of `payload`
    pub size_bytes: u64,
    /// When the entry was stored
    pub stored_at: DateTime<Utc>,
    /// Expiration instant, None = no expiration
    pub expires_at: Option<DateTime<Utc>>,
    /// Insertion order, used to break expiry ties
    pub sequence: u64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry stored at `now`.
    ///
    /// A zero `ttl` means the entry never expires.
    pub fn new(
        key: CacheKey,
        payload: Vec<u8>,
        ttl: Duration,
        now: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            key,
            size_bytes: payload.len() as u64,
            payload,
            stored_at: now,
            expires_at: expiry_for(now, ttl),
            sequence,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired at `now`.
    ///
    /// An entry is expired once `now >= expires_at`; it is present strictly
    /// before that instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires) => now >= expires,
            None => false,
        }
    }

    // == Time To Live ==
    /// Remaining lifetime at `now`, or None if the entry never expires.
    ///
    /// Returns `Some(Duration::ZERO)` once expired.
    pub fn ttl_remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at
            .map(|expires| (expires - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Absolute expiry for a TTL starting at `now`. Zero TTL and overflow both
/// mean "never".
pub(crate) fn expiry_for(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    if ttl.is_zero() {
        return None;
    }
    now.checked_add_signed(to_chrono(ttl))
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_ttl(ttl: Duration, now: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(CacheKey::new("k", ""), vec![0u8; 16], ttl, now, 0)
    }

    #[test]
    fn test_entry_size_matches_payload() {
        let entry = CacheEntry::new(CacheKey::new("k", ""), vec![1, 2, 3], Duration::from_secs(5), Utc::now(), 7);
        assert_eq!(entry.size_bytes, 3);
        assert_eq!(entry.sequence, 7);
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let now = Utc::now();
        let entry = entry_with_ttl(Duration::ZERO, now);

        assert!(entry.expires_at.is_none());
        assert!(!entry.is_expired_at(now + chrono::Duration::days(3650)));
        assert!(entry.ttl_remaining_at(now).is_none());
    }

    #[test]
    fn test_present_before_expiry() {
        let now = Utc::now();
        let entry = entry_with_ttl(Duration::from_secs(60), now);

        assert!(!entry.is_expired_at(now));
        assert!(!entry.is_expired_at(now + chrono::Duration::seconds(30)));
        assert!(!entry.is_expired_at(now + chrono::Duration::milliseconds(59_999)));
    }

    #[test]
    fn test_expiration_boundary_condition() {
        // Expired exactly at the expiry instant, not one tick later.
        let now = Utc::now();
        let entry = entry_with_ttl(Duration::from_secs(60), now);

        assert!(entry.is_expired_at(now + chrono::Duration::seconds(60)));
        assert!(entry.is_expired_at(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_ttl_remaining() {
        let now = Utc::now();
        let entry = entry_with_ttl(Duration::from_secs(10), now);

        assert_eq!(
            entry.ttl_remaining_at(now + chrono::Duration::seconds(4)),
            Some(Duration::from_secs(6))
        );
        assert_eq!(
            entry.ttl_remaining_at(now + chrono::Duration::seconds(20)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_huge_ttl_saturates_to_never() {
        let now = Utc::now();
        assert!(expiry_for(now, Duration::MAX).is_none());
    }
}

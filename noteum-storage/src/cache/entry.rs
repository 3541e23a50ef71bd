//! Cache entries and size estimation.

use noteum_core::constants::FALLBACK_ENTRY_SIZE;
use noteum_core::Timestamp;
use serde::Serialize;
use tokio::time::Instant;

/// Ordering metadata shared with the eviction policies.
///
/// Sequence numbers come from the engine's logical clock, so ordering is
/// total even when two operations share a wall-clock millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryMeta {
    /// Tick of the most recent insertion (a re-`set` counts).
    pub inserted_seq: u64,
    /// Tick of the most recent hit or insertion.
    pub last_access_seq: u64,
    /// Number of hits since first insertion.
    pub access_count: u64,
    pub size_bytes: u64,
}

/// A resident cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub inserted_at: Timestamp,
    pub last_accessed_at: Timestamp,
    pub(crate) expires_at: Option<Instant>,
    pub meta: EntryMeta,
}

impl<T> CacheEntry<T> {
    pub(crate) fn new(value: T, meta: EntryMeta, expires_at: Option<Instant>) -> Self {
        let now = noteum_core::now();
        Self {
            value,
            inserted_at: now,
            last_accessed_at: now,
            expires_at,
            meta,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }

    pub fn access_count(&self) -> u64 {
        self.meta.access_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.meta.size_bytes
    }

    pub(crate) fn touch(&mut self, tick: u64) {
        self.meta.access_count += 1;
        self.meta.last_access_seq = tick;
        self.last_accessed_at = noteum_core::now();
    }
}

/// Length of the JSON encoding, or [`FALLBACK_ENTRY_SIZE`] when the value
/// does not serialize.
pub fn estimate_size<T: Serialize>(value: &T) -> u64 {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes.len() as u64,
        Err(e) => {
            tracing::debug!(error = %e, "Size estimate fell back to default");
            FALLBACK_ENTRY_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use std::time::Duration;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("refuses to serialize"))
        }
    }

    #[test]
    fn test_estimate_size_is_json_length() {
        assert_eq!(estimate_size(&"abc"), 5);
        assert_eq!(estimate_size(&vec![1, 2, 3]), 7);
    }

    #[test]
    fn test_estimate_size_falls_back() {
        assert_eq!(estimate_size(&Unserializable), FALLBACK_ENTRY_SIZE);
    }

    #[test]
    fn test_expiry_is_strict() {
        let at = Instant::now();
        let entry = CacheEntry::new(1, EntryMeta::default(), Some(at));
        assert!(!entry.is_expired_at(at));
        assert!(entry.is_expired_at(at + Duration::from_millis(1)));
        let forever = CacheEntry::new(1, EntryMeta::default(), None);
        assert!(!forever.is_expired_at(at + Duration::from_secs(3600)));
    }
}

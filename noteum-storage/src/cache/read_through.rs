//! Read-through cache over the Record Store's cache table.
//!
//! Reads try the in-process engine first and fall back to the store; writes
//! go to the store and then into the engine; deletes invalidate both. The
//! store stays the source of truth, so the engine can be dropped or cleared
//! at any time.

use std::time::Duration;

use noteum_core::constants::MAX_CACHEABLE_FRACTION;
use noteum_core::{CacheConfig, CacheRecord, NoteumResult, Record};

use super::engine::CacheEngine;
use super::entry::estimate_size;
use super::stats::CacheStats;
use crate::record_store::RecordStore;

/// Cache table access with an in-process read-through layer.
#[derive(Clone)]
pub struct CachedRecordStore {
    store: RecordStore,
    cache: CacheEngine<CacheRecord>,
    max_cacheable: u64,
}

impl CachedRecordStore {
    pub fn new(store: RecordStore, config: CacheConfig) -> Self {
        let max_cacheable = (config.max_bytes as f64 * MAX_CACHEABLE_FRACTION) as u64;
        Self {
            store,
            cache: CacheEngine::new(config),
            max_cacheable,
        }
    }

    /// Wrap an existing engine.
    pub fn with_engine(store: RecordStore, cache: CacheEngine<CacheRecord>) -> Self {
        let max_cacheable = (cache.config().max_bytes as f64 * MAX_CACHEABLE_FRACTION) as u64;
        Self {
            store,
            cache,
            max_cacheable,
        }
    }

    pub fn engine(&self) -> &CacheEngine<CacheRecord> {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Read a cache record. Records past their `expires_at` read as absent.
    pub async fn get(&self, key: &str) -> NoteumResult<Option<CacheRecord>> {
        let now = noteum_core::now();
        if let Some(record) = self.cache.get(key) {
            if record.expires_at().is_some_and(|at| at < now) {
                self.cache.delete(key);
                return Ok(None);
            }
            return Ok(Some(record));
        }

        let Some(record) = self.store.cache().get(key).await? else {
            return Ok(None);
        };
        if record.expires_at().is_some_and(|at| at < now) {
            return Ok(None);
        }
        self.populate(&record);
        Ok(Some(record))
    }

    /// Write through to the store, then cache the stored record.
    pub async fn set(&self, record: CacheRecord) -> NoteumResult<CacheRecord> {
        let stored = self.store.cache().put(record).await?;
        self.populate(&stored);
        Ok(stored)
    }

    /// Remove from the store and the engine.
    pub async fn delete(&self, key: &str) -> NoteumResult<bool> {
        self.cache.delete(key);
        self.store.cache().delete(key).await
    }

    /// Drop a key from the engine only.
    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.delete(key)
    }

    fn populate(&self, record: &CacheRecord) {
        let size = estimate_size(record);
        if size > self.max_cacheable {
            tracing::debug!(key = %record.key, size, limit = self.max_cacheable, "Record too large to cache");
            self.cache.delete(&record.key);
            return;
        }
        let mut ttl = self.cache.config().ttl();
        if let Some(expires_at) = record.expires_at {
            let remaining = (expires_at - noteum_core::now())
                .to_std()
                .unwrap_or(Duration::from_millis(1));
            if ttl.is_zero() || remaining < ttl {
                ttl = remaining.max(Duration::from_millis(1));
            }
        }
        self.cache.set_with_ttl(record.key.clone(), record.clone(), ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use chrono::Duration as ChronoDuration;
    use noteum_core::StoreConfig;
    use std::sync::Arc;

    async fn cached(config: CacheConfig) -> CachedRecordStore {
        let store = RecordStore::new(
            Arc::new(MemoryObjectStore::new()),
            StoreConfig::default().with_auto_cleanup(false),
        );
        store.initialize().await.expect("initialize should succeed");
        CachedRecordStore::new(store, config)
    }

    #[tokio::test]
    async fn test_read_falls_through_then_hits() {
        let cached = cached(CacheConfig::default()).await;
        cached
            .store
            .cache()
            .put(CacheRecord::new("k", "v"))
            .await
            .expect("put should succeed");

        assert!(cached.get("k").await.expect("get should succeed").is_some());
        assert_eq!(cached.stats().misses, 1);
        assert!(cached.get("k").await.expect("get should succeed").is_some());
        assert_eq!(cached.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_write_through_and_delete() {
        let cached = cached(CacheConfig::default()).await;
        cached
            .set(CacheRecord::new("k", "v").with_source("api"))
            .await
            .expect("set should succeed");
        assert!(cached.engine().has("k"));
        assert_eq!(cached.store.cache().count().await.expect("count should succeed"), 1);

        assert!(cached.delete("k").await.expect("delete should succeed"));
        assert!(!cached.engine().has("k"));
        assert!(cached.get("k").await.expect("get should succeed").is_none());
    }

    #[tokio::test]
    async fn test_large_records_are_not_cached() {
        let cached = cached(CacheConfig::default().with_max_bytes(1000)).await;
        cached
            .set(CacheRecord::new("big", "x".repeat(500)))
            .await
            .expect("set should succeed");
        assert!(!cached.engine().has("big"));
        assert!(cached.get("big").await.expect("get should succeed").is_some());
    }

    #[tokio::test]
    async fn test_expired_store_record_reads_absent() {
        let cached = cached(CacheConfig::default()).await;
        cached
            .store
            .cache()
            .put(CacheRecord::new("old", "v").with_expires_at(noteum_core::now() - ChronoDuration::minutes(1)))
            .await
            .expect("put should succeed");
        assert!(cached.get("old").await.expect("get should succeed").is_none());
        assert!(!cached.engine().has("old"));
    }
}

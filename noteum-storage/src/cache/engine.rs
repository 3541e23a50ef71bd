//! In-process cache engine.
//!
//! Entries live in one index; a pluggable [`EvictionPolicy`] orders them.
//! The engine never surfaces errors: a poisoned lock or an unserializable
//! value degrades to a miss (or a rejected `set`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use noteum_core::{CacheConfig, EvictionStrategy};
use noteum_events::{ChangeEvent, ChangeNotifier, ChangeType};
use serde::Serialize;
use tokio::time::Instant;

use super::adaptive::StrategyDecision;
use super::entry::{estimate_size, CacheEntry, EntryMeta};
use super::policy::{new_policy, EvictionPolicy, RemovalReason};
use super::stats::{CacheStats, PerformanceMetrics};
use crate::task::{spawn_periodic, BackgroundTask};

/// Event source name for cache mutations.
pub const CACHE_SOURCE: &str = "cache";

struct EngineState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    policy: Box<dyn EvictionPolicy>,
    total_size: u64,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<T> EngineState<T> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove_entry(&mut self, key: &str, reason: RemovalReason) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.total_size = self.total_size.saturating_sub(entry.meta.size_bytes);
        self.policy.on_remove(key, reason);
        Some(entry)
    }

    /// Evict the policy's victim. Returns false when nothing is left.
    fn evict_one(&mut self) -> bool {
        let Some(victim) = self.policy.victim() else {
            return false;
        };
        match self.remove_entry(&victim, RemovalReason::Evicted) {
            Some(entry) => {
                self.evictions += 1;
                tracing::debug!(
                    key = %victim,
                    size = entry.meta.size_bytes,
                    strategy = self.policy.strategy().as_str(),
                    "Cache entry evicted"
                );
            }
            // Policy out of step with the index; drop the stale key.
            None => self.policy.on_remove(&victim, RemovalReason::Evicted),
        }
        true
    }

    fn snapshot_meta(&self) -> Vec<(String, EntryMeta)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.meta))
            .collect()
    }
}

struct EngineInner<T> {
    config: CacheConfig,
    state: Mutex<EngineState<T>>,
    notifier: Option<ChangeNotifier>,
    tasks: Mutex<Vec<BackgroundTask>>,
}

/// Bounded, expiring in-memory cache. Cheap to clone; clones share entries.
pub struct CacheEngine<T> {
    inner: Arc<EngineInner<T>>,
}

impl<T> Clone for CacheEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> CacheEngine<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Engine that publishes mutations to `notifier`.
    pub fn with_notifier(config: CacheConfig, notifier: ChangeNotifier) -> Self {
        Self::build(config, Some(notifier))
    }

    fn build(config: CacheConfig, notifier: Option<ChangeNotifier>) -> Self {
        let state = EngineState {
            entries: HashMap::new(),
            policy: new_policy(&config),
            total_size: 0,
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        };
        Self {
            inner: Arc::new(EngineInner {
                config,
                state: Mutex::new(state),
                notifier,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn lock(&self) -> Option<MutexGuard<'_, EngineState<T>>> {
        match self.inner.state.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!("Cache state lock poisoned; treating as miss");
                None
            }
        }
    }

    fn emit(&self, events: Vec<ChangeEvent>) {
        if let Some(notifier) = &self.inner.notifier {
            for event in events {
                notifier.notify(event);
            }
        }
    }

    // ========================================================================
    // CORE OPERATIONS
    // ========================================================================

    /// Read a value. Expired entries are deleted and reported as misses.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let tick = state.next_tick();

        let expired = match state.entries.get(key) {
            None => {
                state.misses += 1;
                state.policy.on_lookup(key, false);
                return None;
            }
            Some(entry) => entry.is_expired_at(Instant::now()),
        };

        if expired {
            state.remove_entry(key, RemovalReason::Expired);
            state.misses += 1;
            state.expirations += 1;
            state.policy.on_lookup(key, false);
            drop(guard);
            self.emit(vec![ChangeEvent::new(key, ChangeType::Removed, CACHE_SOURCE)]);
            return None;
        }

        let entry = state.entries.get_mut(key)?;
        entry.touch(tick);
        let meta = entry.meta;
        let value = entry.value.clone();
        state.policy.on_access(key, &meta);
        state.policy.on_lookup(key, true);
        state.hits += 1;
        Some(value)
    }

    /// Insert with the configured TTL.
    pub fn set(&self, key: impl Into<String>, value: T) -> bool {
        let ttl = self.inner.config.ttl();
        self.set_with_ttl(key, value, ttl)
    }

    /// Insert with an explicit TTL; `Duration::ZERO` never expires.
    ///
    /// Returns false when the value alone exceeds the byte ceiling.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: T, ttl: Duration) -> bool {
        let key = key.into();
        let size = estimate_size(&value);
        let max_bytes = self.inner.config.max_bytes;
        let max_entries = self.inner.config.max_entries;
        if size > max_bytes {
            tracing::debug!(key = %key, size, max_bytes, "Value larger than cache; not cached");
            return false;
        }

        let Some(mut guard) = self.lock() else {
            return false;
        };
        let state = &mut *guard;
        let tick = state.next_tick();

        let previous = state.remove_entry(&key, RemovalReason::Replaced);
        let access_count = previous.as_ref().map(|e| e.meta.access_count).unwrap_or(0);

        while state.total_size + size > max_bytes && state.evict_one() {}
        while state.entries.len() >= max_entries && state.evict_one() {}

        let meta = EntryMeta {
            inserted_seq: tick,
            last_access_seq: tick,
            access_count,
            size_bytes: size,
        };
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        state
            .entries
            .insert(key.clone(), CacheEntry::new(value, meta, expires_at));
        state.total_size += size;
        state.policy.on_insert(&key, &meta);
        drop(guard);

        let change = if previous.is_some() {
            ChangeType::Updated
        } else {
            ChangeType::Added
        };
        self.emit(vec![ChangeEvent::new(key, change, CACHE_SOURCE)]);
        true
    }

    /// Remove a key. Returns whether it was resident.
    pub fn delete(&self, key: &str) -> bool {
        let Some(mut guard) = self.lock() else {
            return false;
        };
        let removed = guard.remove_entry(key, RemovalReason::Deleted).is_some();
        drop(guard);
        if removed {
            self.emit(vec![ChangeEvent::new(key, ChangeType::Removed, CACHE_SOURCE)]);
        }
        removed
    }

    /// Whether a non-expired entry exists. Does not count as an access.
    pub fn has(&self, key: &str) -> bool {
        self.lock()
            .and_then(|state| {
                state
                    .entries
                    .get(key)
                    .map(|e| !e.is_expired_at(Instant::now()))
            })
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        let Some(mut guard) = self.lock() else {
            return;
        };
        let cleared = guard.entries.len();
        guard.entries.clear();
        guard.policy.clear();
        guard.total_size = 0;
        drop(guard);
        tracing::debug!(entries = cleared, "Cache cleared");
        self.emit(vec![ChangeEvent::cleared(CACHE_SOURCE, CACHE_SOURCE)]);
    }

    /// Resident keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .map(|state| state.entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Strategy currently deciding evictions.
    pub fn strategy(&self) -> EvictionStrategy {
        self.lock()
            .map(|state| state.policy.strategy())
            .unwrap_or(self.inner.config.strategy)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let Some(mut guard) = self.lock() else {
            return 0;
        };
        let now = Instant::now();
        let expired: Vec<String> = guard
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            guard.remove_entry(key, RemovalReason::Expired);
        }
        guard.expirations += expired.len() as u64;
        drop(guard);

        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "Expired cache entries swept");
        }
        let count = expired.len();
        self.emit(
            expired
                .into_iter()
                .map(|k| ChangeEvent::new(k, ChangeType::Removed, CACHE_SOURCE))
                .collect(),
        );
        count
    }

    /// Run an adaptive evaluation now. Returns the decision if the strategy
    /// changed.
    pub fn evaluate_strategy(&self) -> Option<StrategyDecision> {
        let mut guard = self.lock()?;
        let entries = guard.snapshot_meta();
        guard.policy.evaluate(&entries)
    }

    pub fn reset_stats(&self) {
        if let Some(mut state) = self.lock() {
            state.hits = 0;
            state.misses = 0;
            state.evictions = 0;
            state.expirations = 0;
        }
    }

    pub fn stats(&self) -> CacheStats {
        let adaptive = self.inner.config.strategy == EvictionStrategy::Adaptive;
        match self.lock() {
            Some(state) => CacheStats {
                hits: state.hits,
                misses: state.misses,
                evictions: state.evictions,
                expirations: state.expirations,
                entries: state.entries.len(),
                total_size: state.total_size,
                strategy: state.policy.strategy(),
                adaptive,
            },
            None => CacheStats {
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                entries: 0,
                total_size: 0,
                strategy: self.inner.config.strategy,
                adaptive,
            },
        }
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        let stats = self.stats();
        let decisions = self
            .lock()
            .map(|state| state.policy.decisions())
            .unwrap_or_default();
        PerformanceMetrics::from_stats(&stats, self.inner.config.max_bytes, decisions)
    }

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    /// Start the expiration sweep and, for the adaptive strategy, the
    /// periodic evaluation. Requires a tokio runtime; a no-op otherwise or
    /// when already running.
    pub fn start_background(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("No tokio runtime; cache background tasks not started");
            return;
        }
        let Ok(mut tasks) = self.inner.tasks.lock() else {
            return;
        };
        if !tasks.is_empty() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        tasks.push(spawn_periodic(
            "cache-sweep",
            self.inner.config.sweep_interval(),
            move || {
                let engine = upgrade(&weak);
                async move {
                    match engine {
                        Some(engine) => {
                            engine.sweep_expired();
                            true
                        }
                        None => false,
                    }
                }
            },
        ));

        if self.inner.config.strategy == EvictionStrategy::Adaptive {
            let weak = Arc::downgrade(&self.inner);
            tasks.push(spawn_periodic(
                "cache-adaptive",
                self.inner.config.adaptive_interval(),
                move || {
                    let engine = upgrade(&weak);
                    async move {
                        match engine {
                            Some(engine) => {
                                engine.evaluate_strategy();
                                true
                            }
                            None => false,
                        }
                    }
                },
            ));
        }
    }

    /// Stop background tasks. In-flight runs complete.
    pub async fn shutdown(&self) {
        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return,
        };
        for task in tasks {
            task.stop().await;
        }
    }
}

fn upgrade<T>(weak: &Weak<EngineInner<T>>) -> Option<CacheEngine<T>> {
    weak.upgrade().map(|inner| CacheEngine { inner })
}

impl<T> std::fmt::Debug for CacheEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("strategy", &self.inner.config.strategy)
            .field("max_bytes", &self.inner.config.max_bytes)
            .field("max_entries", &self.inner.config.max_entries)
            .finish()
    }
}

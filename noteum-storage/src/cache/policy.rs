//! Eviction policies over the engine's shared entry index.
//!
//! A policy only tracks ordering. The engine owns the entries and tells the
//! policy about every insertion, hit and removal; the policy names the next
//! victim. Each resident key sits in exactly one ordering structure.

use std::collections::{BTreeMap, HashMap};

use noteum_core::{CacheConfig, EvictionStrategy};

use super::adaptive::{AdaptivePolicy, StrategyDecision};
use super::entry::EntryMeta;

/// Why a key left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Evicted,
    /// The key is about to be re-inserted with a new value.
    Replaced,
    Deleted,
    Expired,
    Cleared,
}

/// Ordering structure deciding which entry to evict.
pub trait EvictionPolicy: Send {
    /// The strategy currently making eviction decisions.
    fn strategy(&self) -> EvictionStrategy;

    /// A key was inserted or re-inserted.
    fn on_insert(&mut self, key: &str, meta: &EntryMeta);

    /// A resident key was read.
    fn on_access(&mut self, key: &str, meta: &EntryMeta);

    fn on_remove(&mut self, key: &str, reason: RemovalReason);

    /// Every lookup, hit or miss. Only policies that simulate traffic care.
    fn on_lookup(&mut self, _key: &str, _hit: bool) {}

    /// Next key to evict, if any.
    fn victim(&self) -> Option<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);

    /// Replace the ordering with one built from `entries`.
    fn rebuild(&mut self, entries: &[(String, EntryMeta)]) {
        self.clear();
        let mut sorted: Vec<&(String, EntryMeta)> = entries.iter().collect();
        sorted.sort_by_key(|(_, meta)| meta.inserted_seq);
        for (key, meta) in sorted {
            self.on_insert(key, meta);
        }
    }

    /// Periodic self-evaluation. Returns a decision when the policy changed
    /// its own behaviour.
    fn evaluate(&mut self, _entries: &[(String, EntryMeta)]) -> Option<StrategyDecision> {
        None
    }

    /// Recent strategy evaluations, oldest first.
    fn decisions(&self) -> Vec<StrategyDecision> {
        Vec::new()
    }
}

/// Build the policy for a cache configuration.
pub fn new_policy(config: &CacheConfig) -> Box<dyn EvictionPolicy> {
    match config.strategy {
        EvictionStrategy::Adaptive => Box::new(AdaptivePolicy::new(
            config.max_entries,
            config.max_bytes,
            config.improvement_threshold,
        )),
        other => concrete_policy(other),
    }
}

/// A single concrete (non-adaptive) policy.
pub(crate) fn concrete_policy(strategy: EvictionStrategy) -> Box<dyn EvictionPolicy> {
    match strategy {
        EvictionStrategy::Lfu => Box::new(LfuPolicy::default()),
        EvictionStrategy::Fifo => Box::new(FifoPolicy::default()),
        EvictionStrategy::Lru | EvictionStrategy::Adaptive => Box::new(LruPolicy::default()),
    }
}

// ============================================================================
// ORDERED QUEUE (shared by LRU and FIFO)
// ============================================================================

/// Keys ordered by a sequence number; the smallest is the victim.
#[derive(Debug, Default)]
struct SeqQueue {
    order: BTreeMap<u64, String>,
    position: HashMap<String, u64>,
}

impl SeqQueue {
    fn place(&mut self, key: &str, seq: u64) {
        if let Some(old) = self.position.insert(key.to_string(), seq) {
            self.order.remove(&old);
        }
        self.order.insert(seq, key.to_string());
    }

    fn remove(&mut self, key: &str) {
        if let Some(seq) = self.position.remove(key) {
            self.order.remove(&seq);
        }
    }

    fn head(&self) -> Option<String> {
        self.order.first_key_value().map(|(_, key)| key.clone())
    }

    fn len(&self) -> usize {
        self.position.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.position.clear();
    }
}

// ============================================================================
// LRU
// ============================================================================

/// Evicts the entry with the oldest last access.
#[derive(Debug, Default)]
pub struct LruPolicy {
    queue: SeqQueue,
}

impl EvictionPolicy for LruPolicy {
    fn strategy(&self) -> EvictionStrategy {
        EvictionStrategy::Lru
    }

    fn on_insert(&mut self, key: &str, meta: &EntryMeta) {
        self.queue.place(key, meta.last_access_seq);
    }

    fn on_access(&mut self, key: &str, meta: &EntryMeta) {
        self.queue.place(key, meta.last_access_seq);
    }

    fn on_remove(&mut self, key: &str, _reason: RemovalReason) {
        self.queue.remove(key);
    }

    fn victim(&self) -> Option<String> {
        self.queue.head()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn clear(&mut self) {
        self.queue.clear();
    }

    fn rebuild(&mut self, entries: &[(String, EntryMeta)]) {
        self.clear();
        for (key, meta) in entries {
            self.queue.place(key, meta.last_access_seq);
        }
    }
}

// ============================================================================
// FIFO
// ============================================================================

/// Evicts in insertion order; reads do not reorder.
#[derive(Debug, Default)]
pub struct FifoPolicy {
    queue: SeqQueue,
}

impl EvictionPolicy for FifoPolicy {
    fn strategy(&self) -> EvictionStrategy {
        EvictionStrategy::Fifo
    }

    fn on_insert(&mut self, key: &str, meta: &EntryMeta) {
        self.queue.place(key, meta.inserted_seq);
    }

    fn on_access(&mut self, _key: &str, _meta: &EntryMeta) {}

    fn on_remove(&mut self, key: &str, _reason: RemovalReason) {
        self.queue.remove(key);
    }

    fn victim(&self) -> Option<String> {
        self.queue.head()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn clear(&mut self) {
        self.queue.clear();
    }
}

// ============================================================================
// LFU
// ============================================================================

/// One resident key, linked into its frequency bucket.
#[derive(Debug)]
struct LfuNode {
    key: String,
    freq: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Non-empty bucket: oldest arrival at `head`, newest at `tail`.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    head: usize,
    tail: usize,
}

/// Evicts from the lowest-frequency bucket, oldest arrival in the bucket
/// first.
///
/// Buckets are intrusive lists over a node slab, so a hit moves a key
/// between buckets in O(1). The minimum frequency is tracked as a cursor;
/// only a removal that empties the minimum bucket rescans the bucket keys.
#[derive(Debug, Default)]
pub struct LfuPolicy {
    nodes: Vec<Option<LfuNode>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    buckets: HashMap<u64, Bucket>,
    min_freq: Option<u64>,
}

impl LfuPolicy {
    fn node(&self, idx: usize) -> Option<&LfuNode> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut LfuNode> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    /// Take a node out of its bucket. Returns the bucket's frequency and
    /// whether the bucket is now empty.
    fn unlink(&mut self, idx: usize) -> Option<(u64, bool)> {
        let (freq, prev, next) = {
            let node = self.node(idx)?;
            (node.freq, node.prev, node.next)
        };
        if let Some(node) = prev.and_then(|p| self.node_mut(p)) {
            node.next = next;
        }
        if let Some(node) = next.and_then(|n| self.node_mut(n)) {
            node.prev = prev;
        }

        let emptied = prev.is_none() && next.is_none();
        if emptied {
            self.buckets.remove(&freq);
        } else if let Some(bucket) = self.buckets.get_mut(&freq) {
            if let (true, Some(next)) = (bucket.head == idx, next) {
                bucket.head = next;
            }
            if let (true, Some(prev)) = (bucket.tail == idx, prev) {
                bucket.tail = prev;
            }
        }
        Some((freq, emptied))
    }

    fn push_back(&mut self, idx: usize, freq: u64) {
        let tail = self.buckets.get(&freq).map(|b| b.tail);
        if let Some(node) = self.node_mut(idx) {
            node.freq = freq;
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(tail) => {
                if let Some(node) = self.node_mut(tail) {
                    node.next = Some(idx);
                }
                if let Some(bucket) = self.buckets.get_mut(&freq) {
                    bucket.tail = idx;
                }
            }
            None => {
                self.buckets.insert(freq, Bucket { head: idx, tail: idx });
            }
        }
    }

    /// Move `key` to the back of the `freq` bucket, creating it if needed.
    fn place(&mut self, key: &str, freq: u64) {
        let Some(idx) = self.index.get(key).copied() else {
            let node = LfuNode {
                key: key.to_string(),
                freq,
                prev: None,
                next: None,
            };
            let idx = match self.free.pop() {
                Some(idx) => {
                    if let Some(slot) = self.nodes.get_mut(idx) {
                        *slot = Some(node);
                    }
                    idx
                }
                None => {
                    self.nodes.push(Some(node));
                    self.nodes.len() - 1
                }
            };
            self.index.insert(key.to_string(), idx);
            self.push_back(idx, freq);
            self.min_freq = Some(self.min_freq.map_or(freq, |min| min.min(freq)));
            return;
        };

        let Some((old, emptied)) = self.unlink(idx) else {
            return;
        };
        self.push_back(idx, freq);
        self.min_freq = match self.min_freq {
            // Every other key sits above `old`.
            Some(min) if emptied && min == old => {
                if freq <= old + 1 {
                    Some(freq)
                } else {
                    self.buckets.keys().min().copied()
                }
            }
            Some(min) => Some(min.min(freq)),
            None => Some(freq),
        };
    }

    fn detach(&mut self, key: &str) {
        let Some(idx) = self.index.remove(key) else {
            return;
        };
        let unlinked = self.unlink(idx);
        if let Some(slot) = self.nodes.get_mut(idx) {
            *slot = None;
        }
        self.free.push(idx);
        if let Some((freq, true)) = unlinked {
            if self.min_freq == Some(freq) {
                self.min_freq = self.buckets.keys().min().copied();
            }
        }
    }

    /// Current minimum frequency among resident keys.
    pub fn min_frequency(&self) -> Option<u64> {
        self.min_freq
    }

    pub fn frequency(&self, key: &str) -> Option<u64> {
        self.index.get(key).and_then(|idx| self.node(*idx)).map(|node| node.freq)
    }
}

impl EvictionPolicy for LfuPolicy {
    fn strategy(&self) -> EvictionStrategy {
        EvictionStrategy::Lfu
    }

    fn on_insert(&mut self, key: &str, meta: &EntryMeta) {
        self.place(key, meta.access_count + 1);
    }

    fn on_access(&mut self, key: &str, meta: &EntryMeta) {
        if self.frequency(key) != Some(meta.access_count + 1) {
            self.place(key, meta.access_count + 1);
        }
    }

    fn on_remove(&mut self, key: &str, _reason: RemovalReason) {
        self.detach(key);
    }

    fn victim(&self) -> Option<String> {
        let bucket = self.buckets.get(&self.min_freq?)?;
        self.node(bucket.head).map(|node| node.key.clone())
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.buckets.clear();
        self.min_freq = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(inserted: u64, accessed: u64, count: u64) -> EntryMeta {
        EntryMeta {
            inserted_seq: inserted,
            last_access_seq: accessed,
            access_count: count,
            size_bytes: 1,
        }
    }

    #[test]
    fn test_lru_access_moves_key_to_tail() {
        let mut lru = LruPolicy::default();
        lru.on_insert("a", &meta(1, 1, 0));
        lru.on_insert("b", &meta(2, 2, 0));
        assert_eq!(lru.victim().as_deref(), Some("a"));

        lru.on_access("a", &meta(1, 3, 1));
        assert_eq!(lru.victim().as_deref(), Some("b"));
    }

    #[test]
    fn test_fifo_ignores_access() {
        let mut fifo = FifoPolicy::default();
        fifo.on_insert("a", &meta(1, 1, 0));
        fifo.on_insert("b", &meta(2, 2, 0));
        fifo.on_access("a", &meta(1, 3, 1));
        assert_eq!(fifo.victim().as_deref(), Some("a"));

        fifo.on_remove("a", RemovalReason::Evicted);
        assert_eq!(fifo.victim().as_deref(), Some("b"));
        assert_eq!(fifo.len(), 1);
    }

    #[test]
    fn test_lfu_evicts_min_frequency_oldest_first() {
        let mut lfu = LfuPolicy::default();
        lfu.on_insert("a", &meta(1, 1, 0));
        lfu.on_insert("b", &meta(2, 2, 0));
        lfu.on_insert("c", &meta(3, 3, 0));
        lfu.on_access("a", &meta(1, 4, 1));

        assert_eq!(lfu.min_frequency(), Some(1));
        assert_eq!(lfu.victim().as_deref(), Some("b"));
        lfu.on_remove("b", RemovalReason::Evicted);
        assert_eq!(lfu.victim().as_deref(), Some("c"));
        lfu.on_remove("c", RemovalReason::Evicted);
        assert_eq!(lfu.min_frequency(), Some(2));
        assert_eq!(lfu.victim().as_deref(), Some("a"));
    }

    #[test]
    fn test_lfu_reinsert_keeps_frequency() {
        let mut lfu = LfuPolicy::default();
        lfu.on_insert("a", &meta(1, 1, 0));
        lfu.on_access("a", &meta(1, 2, 1));
        lfu.on_access("a", &meta(1, 3, 2));
        lfu.on_insert("a", &meta(4, 4, 2));
        assert_eq!(lfu.frequency("a"), Some(3));
        assert_eq!(lfu.len(), 1);
    }

    #[test]
    fn test_lfu_min_cursor_follows_hits_and_removals() {
        let mut lfu = LfuPolicy::default();
        lfu.on_insert("a", &meta(1, 1, 0));
        lfu.on_insert("b", &meta(2, 2, 0));
        lfu.on_access("a", &meta(1, 3, 1));
        lfu.on_access("a", &meta(1, 4, 2));
        lfu.on_access("b", &meta(2, 5, 1));
        assert_eq!(lfu.min_frequency(), Some(2));
        assert_eq!(lfu.victim().as_deref(), Some("b"));

        // Removing the only key at the minimum rescans to the next bucket.
        lfu.on_remove("b", RemovalReason::Deleted);
        assert_eq!(lfu.min_frequency(), Some(3));
        assert_eq!(lfu.victim().as_deref(), Some("a"));

        // Freed slots are reused and a fresh key drops the cursor back.
        lfu.on_insert("c", &meta(6, 6, 0));
        assert_eq!(lfu.min_frequency(), Some(1));
        assert_eq!(lfu.victim().as_deref(), Some("c"));
        assert_eq!(lfu.nodes.len(), 2);

        lfu.on_remove("a", RemovalReason::Deleted);
        lfu.on_remove("c", RemovalReason::Deleted);
        assert_eq!(lfu.min_frequency(), None);
        assert_eq!(lfu.victim(), None);
        assert!(lfu.is_empty());
    }

    #[test]
    fn test_rebuild_orders_from_metadata() {
        let entries = vec![
            ("late".to_string(), meta(5, 9, 0)),
            ("early".to_string(), meta(1, 2, 0)),
        ];
        let mut fifo = FifoPolicy::default();
        fifo.rebuild(&entries);
        assert_eq!(fifo.victim().as_deref(), Some("early"));

        let mut lru = LruPolicy::default();
        lru.rebuild(&entries);
        assert_eq!(lru.victim().as_deref(), Some("early"));
        assert_eq!(lru.len(), 2);
    }
}

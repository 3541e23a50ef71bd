//! Adaptive eviction.
//!
//! One concrete policy makes the real eviction decisions. Beside it, a shadow
//! cache per concrete strategy replays the same insertions and lookups under
//! the same capacity limits, so every candidate is scored on identical
//! traffic. Each evaluation scores the shadows as
//! `0.6 * hit_ratio + 0.4 * memory_efficiency` and switches when a candidate
//! beats the active strategy by more than the improvement threshold
//! (relative to the candidate's score). A switch rebuilds the new policy from
//! the live entries, so nothing is dropped.

use std::collections::{HashMap, VecDeque};

use noteum_core::constants::{
    HIT_RATIO_WEIGHT, MEMORY_EFFICIENCY_WEIGHT, STRATEGY_HISTORY_LIMIT, STRATEGY_HISTORY_REPORTED,
};
use noteum_core::{EvictionStrategy, Timestamp};
use serde::Serialize;

use super::entry::EntryMeta;
use super::policy::{concrete_policy, EvictionPolicy, RemovalReason};

const CANDIDATES: [EvictionStrategy; 3] = [
    EvictionStrategy::Lru,
    EvictionStrategy::Lfu,
    EvictionStrategy::Fifo,
];

/// Outcome of one adaptive evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyDecision {
    pub from: EvictionStrategy,
    /// Best-scoring candidate (may equal `from`).
    pub to: EvictionStrategy,
    pub current_score: f64,
    pub candidate_score: f64,
    /// `(candidate - current) / candidate`, 0 when the candidate scores 0.
    pub improvement: f64,
    pub switched: bool,
    pub at: Timestamp,
}

/// Hit ratio and memory efficiency of a policy over a window of traffic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategyScore {
    pub strategy: EvictionStrategy,
    pub hit_ratio: f64,
    pub memory_efficiency: f64,
    pub score: f64,
}

/// Combined score used to rank strategies.
pub fn weighted_score(hit_ratio: f64, memory_efficiency: f64) -> f64 {
    hit_ratio * HIT_RATIO_WEIGHT + memory_efficiency * MEMORY_EFFICIENCY_WEIGHT
}

/// Hit ratio divided by the fraction of the byte ceiling in use, capped
/// at 1. Zero without traffic.
pub fn memory_efficiency(hits: u64, misses: u64, used_bytes: u64, max_bytes: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        return 0.0;
    }
    let hit_ratio = hits as f64 / total as f64;
    if used_bytes == 0 || max_bytes == 0 {
        return hit_ratio.min(1.0);
    }
    let fill = used_bytes as f64 / max_bytes as f64;
    (hit_ratio / fill).min(1.0)
}

// ============================================================================
// SHADOW CACHE
// ============================================================================

/// Key-only simulation of a cache running one strategy.
struct ShadowCache {
    strategy: EvictionStrategy,
    policy: Box<dyn EvictionPolicy>,
    resident: HashMap<String, EntryMeta>,
    bytes: u64,
    max_entries: usize,
    max_bytes: u64,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl ShadowCache {
    fn new(strategy: EvictionStrategy, max_entries: usize, max_bytes: u64) -> Self {
        Self {
            strategy,
            policy: concrete_policy(strategy),
            resident: HashMap::new(),
            bytes: 0,
            max_entries,
            max_bytes,
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn lookup(&mut self, key: &str) {
        self.tick += 1;
        match self.resident.get_mut(key) {
            Some(meta) => {
                meta.access_count += 1;
                meta.last_access_seq = self.tick;
                let meta = *meta;
                self.policy.on_access(key, &meta);
                self.hits += 1;
            }
            None => self.misses += 1,
        }
    }

    /// Mirrors the engine: a rewrite replaces the old entry, keeps its
    /// access count, then evicts until the new size fits.
    fn insert(&mut self, key: &str, size: u64) {
        self.tick += 1;
        if size > self.max_bytes {
            self.remove(key, RemovalReason::Replaced);
            return;
        }
        let access_count = match self.resident.remove(key) {
            Some(previous) => {
                self.bytes -= previous.size_bytes;
                self.policy.on_remove(key, RemovalReason::Replaced);
                previous.access_count
            }
            None => 0,
        };

        while self.bytes + size > self.max_bytes || self.resident.len() >= self.max_entries {
            let Some(victim) = self.policy.victim() else {
                break;
            };
            self.remove(&victim, RemovalReason::Evicted);
        }

        let meta = EntryMeta {
            inserted_seq: self.tick,
            last_access_seq: self.tick,
            access_count,
            size_bytes: size,
        };
        self.resident.insert(key.to_string(), meta);
        self.bytes += size;
        self.policy.on_insert(key, &meta);
    }

    fn remove(&mut self, key: &str, reason: RemovalReason) {
        if let Some(meta) = self.resident.remove(key) {
            self.bytes -= meta.size_bytes;
            self.policy.on_remove(key, reason);
        }
    }

    fn clear(&mut self) {
        self.resident.clear();
        self.policy.clear();
        self.bytes = 0;
    }

    fn score(&self) -> StrategyScore {
        let total = self.hits + self.misses;
        let hit_ratio = if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        };
        let memory_efficiency = memory_efficiency(self.hits, self.misses, self.bytes, self.max_bytes);
        StrategyScore {
            strategy: self.strategy,
            hit_ratio,
            memory_efficiency,
            score: weighted_score(hit_ratio, memory_efficiency),
        }
    }

    fn reset_counters(&mut self) {
        self.hits = 0;
        self.misses = 0;
    }
}

// ============================================================================
// ADAPTIVE POLICY
// ============================================================================

/// Policy that periodically moves to the best-scoring concrete strategy.
pub struct AdaptivePolicy {
    active: Box<dyn EvictionPolicy>,
    shadows: Vec<ShadowCache>,
    threshold: f64,
    history: VecDeque<StrategyDecision>,
}

impl AdaptivePolicy {
    /// Start on LRU with shadows sized to the real cache.
    pub fn new(max_entries: usize, max_bytes: u64, threshold: f64) -> Self {
        Self {
            active: concrete_policy(EvictionStrategy::Lru),
            shadows: CANDIDATES
                .iter()
                .map(|s| ShadowCache::new(*s, max_entries, max_bytes))
                .collect(),
            threshold,
            history: VecDeque::new(),
        }
    }

    /// Current score of every candidate.
    pub fn scores(&self) -> Vec<StrategyScore> {
        self.shadows.iter().map(ShadowCache::score).collect()
    }

    fn record(&mut self, decision: StrategyDecision) {
        if self.history.len() >= STRATEGY_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(decision);
    }
}

impl EvictionPolicy for AdaptivePolicy {
    fn strategy(&self) -> EvictionStrategy {
        self.active.strategy()
    }

    fn on_insert(&mut self, key: &str, meta: &EntryMeta) {
        self.active.on_insert(key, meta);
        for shadow in &mut self.shadows {
            shadow.insert(key, meta.size_bytes);
        }
    }

    fn on_access(&mut self, key: &str, meta: &EntryMeta) {
        self.active.on_access(key, meta);
    }

    fn on_remove(&mut self, key: &str, reason: RemovalReason) {
        self.active.on_remove(key, reason);
        // Shadows run their own capacity and see the re-insert anyway.
        if !matches!(reason, RemovalReason::Evicted | RemovalReason::Replaced) {
            for shadow in &mut self.shadows {
                shadow.remove(key, reason);
            }
        }
    }

    fn on_lookup(&mut self, key: &str, _hit: bool) {
        for shadow in &mut self.shadows {
            shadow.lookup(key);
        }
    }

    fn victim(&self) -> Option<String> {
        self.active.victim()
    }

    fn len(&self) -> usize {
        self.active.len()
    }

    fn clear(&mut self) {
        self.active.clear();
        for shadow in &mut self.shadows {
            shadow.clear();
        }
    }

    fn rebuild(&mut self, entries: &[(String, EntryMeta)]) {
        self.active.rebuild(entries);
    }

    fn evaluate(&mut self, entries: &[(String, EntryMeta)]) -> Option<StrategyDecision> {
        let current = self.active.strategy();
        let scores = self.scores();
        let current_score = scores
            .iter()
            .find(|s| s.strategy == current)
            .map(|s| s.score)
            .unwrap_or(0.0);

        // Ties keep the active strategy.
        let best = scores.iter().fold(None::<&StrategyScore>, |best, s| match best {
            Some(b) if b.score > s.score || (b.score == s.score && b.strategy == current) => Some(b),
            _ => Some(s),
        });
        let (to, candidate_score) = best
            .map(|b| (b.strategy, b.score))
            .unwrap_or((current, current_score));

        let improvement = if candidate_score > 0.0 {
            (candidate_score - current_score) / candidate_score
        } else {
            0.0
        };
        let switched = to != current && improvement > self.threshold;

        for shadow in &mut self.shadows {
            shadow.reset_counters();
        }

        let decision = StrategyDecision {
            from: current,
            to,
            current_score,
            candidate_score,
            improvement,
            switched,
            at: noteum_core::now(),
        };
        self.record(decision.clone());

        if !switched {
            tracing::debug!(
                strategy = current.as_str(),
                score = current_score,
                best = to.as_str(),
                "Adaptive evaluation kept strategy"
            );
            return None;
        }

        let mut next = concrete_policy(to);
        next.rebuild(entries);
        self.active = next;
        tracing::info!(
            from = current.as_str(),
            to = to.as_str(),
            improvement,
            entries = entries.len(),
            "Adaptive cache switched strategy"
        );
        Some(decision)
    }

    fn decisions(&self) -> Vec<StrategyDecision> {
        let skip = self.history.len().saturating_sub(STRATEGY_HISTORY_REPORTED);
        self.history.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(seq: u64, size: u64) -> EntryMeta {
        EntryMeta {
            inserted_seq: seq,
            last_access_seq: seq,
            access_count: 0,
            size_bytes: size,
        }
    }

    #[test]
    fn test_memory_efficiency_caps_at_one() {
        assert_eq!(memory_efficiency(0, 0, 10, 100), 0.0);
        assert_eq!(memory_efficiency(5, 5, 90, 100), 0.5 / 0.9);
        assert_eq!(memory_efficiency(10, 0, 1, 100), 1.0);
    }

    #[test]
    fn test_shadow_rewrite_enforces_byte_ceiling() {
        let mut shadow = ShadowCache::new(EvictionStrategy::Fifo, 10, 100);
        shadow.insert("a", 40);
        shadow.insert("b", 40);
        shadow.lookup("b");

        // Growing "b" past the ceiling evicts "a", the FIFO head.
        shadow.insert("b", 90);
        assert_eq!(shadow.bytes, 90);
        assert!(!shadow.resident.contains_key("a"));
        assert_eq!(shadow.resident.get("b").map(|m| m.access_count), Some(1));

        // A value larger than the ceiling never becomes resident.
        shadow.insert("b", 150);
        assert_eq!(shadow.bytes, 0);
        assert!(shadow.resident.is_empty());
    }

    #[test]
    fn test_starts_on_lru() {
        let policy = AdaptivePolicy::new(10, 1000, 0.1);
        assert_eq!(policy.strategy(), EvictionStrategy::Lru);
        assert_eq!(policy.scores().len(), 3);
    }

    #[test]
    fn test_switches_to_lfu_on_frequency_skewed_traffic() {
        // Two entries fit. One-off keys churn through while a hot key is
        // read between them: LRU and FIFO drop the hot key, LFU keeps it.
        let mut policy = AdaptivePolicy::new(2, 1_000_000, 0.1);
        let mut seq = 0;
        let mut live: Vec<(String, EntryMeta)> = Vec::new();

        seq += 1;
        policy.on_insert("hot", &meta(seq, 10));
        live.push(("hot".to_string(), meta(seq, 10)));
        for _ in 0..5 {
            policy.on_lookup("hot", true);
        }
        for i in 0..20 {
            seq += 1;
            let key = format!("cold{i}");
            policy.on_insert(&key, &meta(seq, 10));
            policy.on_lookup(&key, false);
            seq += 1;
            policy.on_insert(&format!("other{i}"), &meta(seq, 10));
            policy.on_lookup("hot", true);
        }

        let scores = policy.scores();
        let lfu = scores
            .iter()
            .find(|s| s.strategy == EvictionStrategy::Lfu)
            .map(|s| s.hit_ratio)
            .unwrap_or_default();
        let lru = scores
            .iter()
            .find(|s| s.strategy == EvictionStrategy::Lru)
            .map(|s| s.hit_ratio)
            .unwrap_or_default();
        assert!(lfu > lru, "lfu {lfu} should beat lru {lru}");

        let decision = policy.evaluate(&live).expect("strategy should switch");
        assert_eq!(decision.from, EvictionStrategy::Lru);
        assert_eq!(decision.to, EvictionStrategy::Lfu);
        assert!(decision.switched);
        assert_eq!(policy.strategy(), EvictionStrategy::Lfu);
        // Warm switch: the live entry is tracked by the new policy.
        assert_eq!(policy.len(), 1);
        assert_eq!(policy.victim().as_deref(), Some("hot"));
    }

    #[test]
    fn test_no_traffic_keeps_strategy() {
        let mut policy = AdaptivePolicy::new(10, 1000, 0.1);
        assert!(policy.evaluate(&[]).is_none());
        assert_eq!(policy.strategy(), EvictionStrategy::Lru);
        let decisions = policy.decisions();
        assert_eq!(decisions.len(), 1);
        assert!(!decisions[0].switched);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut policy = AdaptivePolicy::new(10, 1000, 0.1);
        for _ in 0..(STRATEGY_HISTORY_LIMIT + 5) {
            policy.evaluate(&[]);
        }
        assert_eq!(policy.history.len(), STRATEGY_HISTORY_LIMIT);
        assert_eq!(policy.decisions().len(), STRATEGY_HISTORY_REPORTED);
    }
}

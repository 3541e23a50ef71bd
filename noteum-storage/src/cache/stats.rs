//! Cache statistics and performance metrics.

use noteum_core::EvictionStrategy;
use serde::Serialize;

use super::adaptive::{memory_efficiency, StrategyDecision};

/// Counters and occupancy of a cache engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of misses, expired reads included.
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Entries removed because their TTL passed.
    pub expirations: u64,
    /// Entries currently resident.
    pub entries: usize,
    /// Sum of the size estimates of resident entries.
    pub total_size: u64,
    /// Strategy currently deciding evictions.
    pub strategy: EvictionStrategy,
    /// Whether the engine adapts its strategy.
    pub adaptive: bool,
}

impl CacheStats {
    /// Hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn total_operations(&self) -> u64 {
        self.hits + self.misses
    }
}

/// Derived performance figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub strategy: EvictionStrategy,
    pub hit_ratio: f64,
    /// Hit ratio per fraction of the byte ceiling in use, capped at 1.
    pub memory_efficiency: f64,
    /// Hits per eviction; 0 before the first eviction.
    pub eviction_efficiency: f64,
    pub average_entry_size: f64,
    pub total_operations: u64,
    /// Most recent adaptive evaluations (empty for fixed strategies).
    pub recent_decisions: Vec<StrategyDecision>,
}

impl PerformanceMetrics {
    pub(crate) fn from_stats(
        stats: &CacheStats,
        max_bytes: u64,
        recent_decisions: Vec<StrategyDecision>,
    ) -> Self {
        let eviction_efficiency = if stats.evictions > 0 {
            stats.hits as f64 / stats.evictions as f64
        } else {
            0.0
        };
        let average_entry_size = if stats.entries > 0 {
            stats.total_size as f64 / stats.entries as f64
        } else {
            0.0
        };
        Self {
            strategy: stats.strategy,
            hit_ratio: stats.hit_rate(),
            memory_efficiency: memory_efficiency(stats.hits, stats.misses, stats.total_size, max_bytes),
            eviction_efficiency,
            average_entry_size,
            total_operations: stats.total_operations(),
            recent_decisions,
        }
    }
}

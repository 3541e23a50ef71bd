//! In-process cache engine with pluggable eviction.
//!
//! The engine is a derived, disposable view: every failure degrades to a
//! miss and nothing here is a source of truth.
//!
//! # Strategies
//!
//! | strategy | victim |
//! |---|---|
//! | LRU | oldest last access |
//! | LFU | lowest access frequency, oldest arrival within the frequency |
//! | FIFO | oldest insertion; reads do not reorder |
//! | Adaptive | whichever of the above currently scores best |
//!
//! # Example
//!
//! ```ignore
//! let cache: CacheEngine<String> = CacheEngine::new(CacheConfig::default());
//! cache.set("greeting", "hello".to_string());
//! assert_eq!(cache.get("greeting").as_deref(), Some("hello"));
//! ```

pub mod adaptive;
pub mod engine;
pub mod entry;
pub mod policy;
pub mod read_through;
pub mod stats;

pub use adaptive::{AdaptivePolicy, StrategyDecision, StrategyScore};
pub use engine::{CacheEngine, CACHE_SOURCE};
pub use entry::{estimate_size, CacheEntry, EntryMeta};
pub use policy::{new_policy, EvictionPolicy, FifoPolicy, LfuPolicy, LruPolicy, RemovalReason};
pub use read_through::CachedRecordStore;
pub use stats::{CacheStats, PerformanceMetrics};

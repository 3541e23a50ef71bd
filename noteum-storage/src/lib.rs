//! Noteum Storage - Record Store and Cache Engine
//!
//! Typed, versioned tables over a pluggable [`ObjectStore`] and the
//! in-process [`CacheEngine`] that sits in front of them.
//!
//! Two object stores ship with the crate: [`MemoryObjectStore`] for tests and
//! ephemeral sessions, and [`LmdbObjectStore`] (heed) for durable storage.

pub mod cache;
pub mod lmdb;
pub mod memory;
pub mod object_store;
pub mod record_store;
pub mod schema;
pub mod task;

pub use cache::{
    CacheEngine, CacheStats, CachedRecordStore, EvictionPolicy, PerformanceMetrics,
    StrategyDecision,
};
pub use lmdb::{LmdbObjectStore, LmdbStoreError};
pub use memory::MemoryObjectStore;
pub use object_store::{Document, ObjectStore, Predicate, Query, WriteBatch, WriteOp};
pub use record_store::{
    doc_size, CleanupOptions, CleanupResult, RecordStore, StoreStats, Table, TableSnapshot,
    TableStats, Transaction, RECORD_STORE_SOURCE,
};
pub use schema::{Schema, TableSchema};
pub use task::{spawn_periodic, BackgroundTask};

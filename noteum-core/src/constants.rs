//! Default values shared across the storage engine.
//!
//! Every configurable knob has its default here so that `Default` impls,
//! `from_env()` fallbacks and documentation agree.

// ============================================================================
// RECORD STORE
// ============================================================================

/// Name of the underlying database.
pub const DB_NAME: &str = "NoteumDB";

/// Schema version declared by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Metadata key holding the stored schema version.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Metadata key written when the store is initialized.
pub const DB_INITIALIZED_KEY: &str = "db_initialized";

/// Metadata key written when the store is closed.
pub const DB_CLOSED_KEY: &str = "db_closed";

/// Cache records older than this are removed by cleanup.
pub const DEFAULT_MAX_AGE_HOURS: u64 = 24;

/// Interval between automatic cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Records sampled per table when estimating sizes.
pub const STATS_SAMPLE_SIZE: usize = 10;

/// LMDB map size in megabytes.
pub const DEFAULT_MAP_SIZE_MB: usize = 100;

// ============================================================================
// CACHE ENGINE
// ============================================================================

/// Default byte ceiling for the in-process cache (10 MiB).
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Default entry ceiling for the in-process cache.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;

/// Default time-to-live for cache entries.
pub const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;

/// Default interval of the expiration sweep.
pub const DEFAULT_CACHE_SWEEP_INTERVAL_MS: u64 = 60 * 1000;

/// Default interval between adaptive strategy evaluations.
pub const DEFAULT_ADAPTIVE_INTERVAL_MS: u64 = 60 * 1000;

/// Relative score improvement required before the adaptive cache switches.
pub const DEFAULT_IMPROVEMENT_THRESHOLD: f64 = 0.1;

/// Size used when an entry cannot be serialized for estimation.
pub const FALLBACK_ENTRY_SIZE: u64 = 100;

/// Strategy decisions retained by the adaptive cache.
pub const STRATEGY_HISTORY_LIMIT: usize = 100;

/// Strategy decisions reported in metrics.
pub const STRATEGY_HISTORY_REPORTED: usize = 10;

/// Weight of hit ratio in the adaptive score.
pub const HIT_RATIO_WEIGHT: f64 = 0.6;

/// Weight of memory efficiency in the adaptive score.
pub const MEMORY_EFFICIENCY_WEIGHT: f64 = 0.4;

/// Items above this fraction of the cache ceiling bypass the read-through cache.
pub const MAX_CACHEABLE_FRACTION: f64 = 0.1;

// ============================================================================
// TOKEN VAULT
// ============================================================================

pub const DEFAULT_TOKEN_EXPIRATION_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_MAX_TOKENS_PER_OWNER: usize = 100;
pub const DEFAULT_TOKEN_CACHE_TTL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_REFRESH_THRESHOLD_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_KDF_ITERATIONS: u32 = 3;
pub const DEFAULT_KDF_MEMORY_KIB: u32 = 19 * 1024;

pub const MIN_TOKEN_LENGTH: usize = 10;
pub const MAX_TOKEN_LENGTH: usize = 4096;
pub const DEFAULT_MIN_SECURITY_SCORE: u8 = 70;

// ============================================================================
// MIGRATIONS AND VALIDATION
// ============================================================================

/// Backups retained by the migrator.
pub const MAX_BACKUPS: usize = 5;

/// Estimated duration of a single migration step.
pub const ESTIMATED_STEP_DURATION_MS: u64 = 1000;

/// Byte drift tolerated between source and migrated values.
pub const DEFAULT_MAX_SIZE_DIFFERENCE: usize = 100;

/// Batches up to this size are validated in full.
pub const FULL_VALIDATION_LIMIT: usize = 100;

/// Batches up to this size are validated by sampling.
pub const SAMPLE_VALIDATION_LIMIT: usize = 1000;

/// Default sample size for sampled validation.
pub const DEFAULT_VALIDATION_SAMPLE: usize = 100;

/// Default stride for incremental validation.
pub const DEFAULT_INCREMENTAL_STRIDE: usize = 10;

// ============================================================================
// CHANGE NOTIFICATION
// ============================================================================

pub const DEFAULT_DEBOUNCE_MS: u64 = 100;
pub const DEFAULT_MAX_LISTENERS: usize = 100;
pub const EVENT_HISTORY_LIMIT: usize = 1000;

//! Configuration types
//!
//! Each subsystem has its own section with a `Default` built from
//! [`crate::constants`], `with_*` setters and a `from_env()` constructor
//! reading `NOTEUM_*` variables. Durations are milliseconds.

use crate::constants::*;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// RECORD STORE
// ============================================================================

/// Record Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_name: String,
    pub schema_version: u32,
    pub auto_cleanup: bool,
    pub cleanup_interval_ms: u64,
    pub max_age_hours: u64,
    pub map_size_mb: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_name: DB_NAME.to_string(),
            schema_version: SCHEMA_VERSION,
            auto_cleanup: true,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            max_age_hours: DEFAULT_MAX_AGE_HOURS,
            map_size_mb: DEFAULT_MAP_SIZE_MB,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            db_name: std::env::var("NOTEUM_DB_NAME").unwrap_or(d.db_name),
            schema_version: env_or("NOTEUM_SCHEMA_VERSION", d.schema_version),
            auto_cleanup: env_or("NOTEUM_AUTO_CLEANUP", d.auto_cleanup),
            cleanup_interval_ms: env_or("NOTEUM_CLEANUP_INTERVAL_MS", d.cleanup_interval_ms),
            max_age_hours: env_or("NOTEUM_MAX_AGE_HOURS", d.max_age_hours),
            map_size_mb: env_or("NOTEUM_MAP_SIZE_MB", d.map_size_mb),
        }
    }

    pub fn with_auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = enabled;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_age_hours(mut self, hours: u64) -> Self {
        self.max_age_hours = hours;
        self
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_name.trim().is_empty() {
            return Err(invalid("store.db_name", &self.db_name, "must not be empty"));
        }
        if self.auto_cleanup && self.cleanup_interval_ms == 0 {
            return Err(invalid("store.cleanup_interval_ms", 0, "must be positive"));
        }
        if self.map_size_mb == 0 {
            return Err(invalid("store.map_size_mb", 0, "must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// CACHE ENGINE
// ============================================================================

/// Eviction strategy of the cache engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    Lru,
    Lfu,
    Fifo,
    Adaptive,
}

impl EvictionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionStrategy::Lru => "lru",
            EvictionStrategy::Lfu => "lfu",
            EvictionStrategy::Fifo => "fifo",
            EvictionStrategy::Adaptive => "adaptive",
        }
    }
}

impl std::str::FromStr for EvictionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(EvictionStrategy::Lru),
            "lfu" => Ok(EvictionStrategy::Lfu),
            "fifo" => Ok(EvictionStrategy::Fifo),
            "adaptive" => Ok(EvictionStrategy::Adaptive),
            other => Err(invalid("cache.strategy", other, "expected lru, lfu, fifo or adaptive")),
        }
    }
}

/// Cache engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub strategy: EvictionStrategy,
    pub max_bytes: u64,
    pub max_entries: usize,
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
    pub adaptive_interval_ms: u64,
    pub improvement_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: EvictionStrategy::Lru,
            max_bytes: DEFAULT_CACHE_MAX_BYTES,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            ttl_ms: DEFAULT_CACHE_TTL_MS,
            sweep_interval_ms: DEFAULT_CACHE_SWEEP_INTERVAL_MS,
            adaptive_interval_ms: DEFAULT_ADAPTIVE_INTERVAL_MS,
            improvement_threshold: DEFAULT_IMPROVEMENT_THRESHOLD,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            strategy: env_or("NOTEUM_CACHE_STRATEGY", d.strategy),
            max_bytes: env_or("NOTEUM_CACHE_MAX_BYTES", d.max_bytes),
            max_entries: env_or("NOTEUM_CACHE_MAX_ENTRIES", d.max_entries),
            ttl_ms: env_or("NOTEUM_CACHE_TTL_MS", d.ttl_ms),
            sweep_interval_ms: env_or("NOTEUM_CACHE_SWEEP_INTERVAL_MS", d.sweep_interval_ms),
            adaptive_interval_ms: env_or("NOTEUM_CACHE_ADAPTIVE_INTERVAL_MS", d.adaptive_interval_ms),
            improvement_threshold: env_or(
                "NOTEUM_CACHE_IMPROVEMENT_THRESHOLD",
                d.improvement_threshold,
            ),
        }
    }

    /// Small cache for development builds.
    pub fn development() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            max_entries: 100,
            ..Self::default()
        }
    }

    /// Larger cache with the adaptive strategy.
    pub fn production() -> Self {
        Self {
            strategy: EvictionStrategy::Adaptive,
            max_bytes: 50 * 1024 * 1024,
            max_entries: 5000,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_improvement_threshold(mut self, threshold: f64) -> Self {
        self.improvement_threshold = threshold;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn adaptive_interval(&self) -> Duration {
        Duration::from_millis(self.adaptive_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(invalid("cache.max_entries", 0, "must be positive"));
        }
        if self.max_bytes == 0 {
            return Err(invalid("cache.max_bytes", 0, "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.improvement_threshold) {
            return Err(invalid(
                "cache.improvement_threshold",
                self.improvement_threshold,
                "must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TOKEN VAULT
// ============================================================================

/// Token vault configuration. The passphrase is not part of it; it is
/// supplied separately as a secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub enable_encryption: bool,
    pub enable_validation: bool,
    pub enable_auto_cleanup: bool,
    pub strict_validation: bool,
    pub default_expiration_ms: u64,
    pub grace_period_ms: u64,
    pub max_tokens_per_owner: usize,
    pub enable_cache: bool,
    pub cache_ttl_ms: u64,
    pub cleanup_interval_ms: u64,
    pub kdf_iterations: u32,
    pub kdf_memory_kib: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            enable_encryption: true,
            enable_validation: true,
            enable_auto_cleanup: true,
            strict_validation: false,
            default_expiration_ms: DEFAULT_TOKEN_EXPIRATION_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            max_tokens_per_owner: DEFAULT_MAX_TOKENS_PER_OWNER,
            enable_cache: true,
            cache_ttl_ms: DEFAULT_TOKEN_CACHE_TTL_MS,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            kdf_memory_kib: DEFAULT_KDF_MEMORY_KIB,
        }
    }
}

impl VaultConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            enable_encryption: env_or("NOTEUM_VAULT_ENCRYPTION", d.enable_encryption),
            enable_validation: env_or("NOTEUM_VAULT_VALIDATION", d.enable_validation),
            enable_auto_cleanup: env_or("NOTEUM_VAULT_AUTO_CLEANUP", d.enable_auto_cleanup),
            strict_validation: env_or("NOTEUM_VAULT_STRICT", d.strict_validation),
            default_expiration_ms: env_or("NOTEUM_VAULT_EXPIRATION_MS", d.default_expiration_ms),
            grace_period_ms: env_or("NOTEUM_VAULT_GRACE_MS", d.grace_period_ms),
            max_tokens_per_owner: env_or("NOTEUM_VAULT_MAX_TOKENS", d.max_tokens_per_owner),
            enable_cache: env_or("NOTEUM_VAULT_CACHE", d.enable_cache),
            cache_ttl_ms: env_or("NOTEUM_VAULT_CACHE_TTL_MS", d.cache_ttl_ms),
            cleanup_interval_ms: env_or("NOTEUM_VAULT_CLEANUP_INTERVAL_MS", d.cleanup_interval_ms),
            kdf_iterations: env_or("NOTEUM_VAULT_KDF_ITERATIONS", d.kdf_iterations),
            kdf_memory_kib: env_or("NOTEUM_VAULT_KDF_MEMORY_KIB", d.kdf_memory_kib),
        }
    }

    pub fn with_max_tokens_per_owner(mut self, max: usize) -> Self {
        self.max_tokens_per_owner = max;
        self
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.enable_encryption = enabled;
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    pub fn with_auto_cleanup(mut self, enabled: bool) -> Self {
        self.enable_auto_cleanup = enabled;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_kdf(mut self, iterations: u32, memory_kib: u32) -> Self {
        self.kdf_iterations = iterations;
        self.kdf_memory_kib = memory_kib;
        self
    }

    pub fn default_expiration(&self) -> Duration {
        Duration::from_millis(self.default_expiration_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tokens_per_owner == 0 {
            return Err(invalid("vault.max_tokens_per_owner", 0, "must be positive"));
        }
        if self.kdf_iterations == 0 {
            return Err(invalid("vault.kdf_iterations", 0, "must be positive"));
        }
        if self.enable_auto_cleanup && self.cleanup_interval_ms == 0 {
            return Err(invalid("vault.cleanup_interval_ms", 0, "must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// MIGRATIONS AND VALIDATION
// ============================================================================

/// Migrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub target_version: u32,
    pub create_backups: bool,
    pub max_backups: usize,
    pub validate_after: bool,
    pub require_valid: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            target_version: SCHEMA_VERSION,
            create_backups: true,
            max_backups: MAX_BACKUPS,
            validate_after: true,
            require_valid: true,
        }
    }
}

impl MigrationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            target_version: env_or("NOTEUM_MIGRATION_TARGET", d.target_version),
            create_backups: env_or("NOTEUM_MIGRATION_BACKUPS", d.create_backups),
            max_backups: env_or("NOTEUM_MIGRATION_MAX_BACKUPS", d.max_backups),
            validate_after: env_or("NOTEUM_MIGRATION_VALIDATE", d.validate_after),
            require_valid: env_or("NOTEUM_MIGRATION_REQUIRE_VALID", d.require_valid),
        }
    }

    pub fn with_target_version(mut self, version: u32) -> Self {
        self.target_version = version;
        self
    }

    pub fn with_backups(mut self, enabled: bool) -> Self {
        self.create_backups = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.create_backups && self.max_backups == 0 {
            return Err(invalid("migration.max_backups", 0, "must be positive"));
        }
        Ok(())
    }
}

/// Post-migration validator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub max_size_difference: usize,
    pub deep_validation: bool,
    pub check_format: bool,
    pub check_corruption: bool,
    /// Upper bound on items checked by the sampled methods. Zero checks
    /// every item.
    pub sample_size: usize,
    pub incremental_stride: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_size_difference: DEFAULT_MAX_SIZE_DIFFERENCE,
            deep_validation: true,
            check_format: true,
            check_corruption: true,
            sample_size: DEFAULT_VALIDATION_SAMPLE,
            incremental_stride: DEFAULT_INCREMENTAL_STRIDE,
        }
    }
}

impl ValidatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_size_difference: env_or("NOTEUM_VALIDATOR_MAX_SIZE_DIFF", d.max_size_difference),
            deep_validation: env_or("NOTEUM_VALIDATOR_DEEP", d.deep_validation),
            check_format: env_or("NOTEUM_VALIDATOR_FORMAT", d.check_format),
            check_corruption: env_or("NOTEUM_VALIDATOR_CORRUPTION", d.check_corruption),
            sample_size: env_or("NOTEUM_VALIDATOR_SAMPLE_SIZE", d.sample_size),
            incremental_stride: env_or("NOTEUM_VALIDATOR_STRIDE", d.incremental_stride),
        }
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn with_max_size_difference(mut self, bytes: usize) -> Self {
        self.max_size_difference = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.incremental_stride == 0 {
            return Err(invalid("validator.incremental_stride", 0, "must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// EVENTS AND TELEMETRY
// ============================================================================

/// Change notification configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub debounce_ms: u64,
    pub max_listeners: usize,
    pub history_limit: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_listeners: DEFAULT_MAX_LISTENERS,
            history_limit: EVENT_HISTORY_LIMIT,
        }
    }
}

impl EventConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            debounce_ms: env_or("NOTEUM_EVENT_DEBOUNCE_MS", d.debounce_ms),
            max_listeners: env_or("NOTEUM_EVENT_MAX_LISTENERS", d.max_listeners),
            history_limit: env_or("NOTEUM_EVENT_HISTORY_LIMIT", d.history_limit),
        }
    }

    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = window.as_millis() as u64;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            log_filter: std::env::var("NOTEUM_LOG").unwrap_or(d.log_filter),
            json: env_or("NOTEUM_LOG_JSON", d.json),
        }
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Aggregated configuration for a storage context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteumConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub vault: VaultConfig,
    pub migration: MigrationConfig,
    pub validator: ValidatorConfig,
    pub events: EventConfig,
    pub telemetry: TelemetryConfig,
}

impl NoteumConfig {
    pub fn from_env() -> Self {
        Self {
            store: StoreConfig::from_env(),
            cache: CacheConfig::from_env(),
            vault: VaultConfig::from_env(),
            migration: MigrationConfig::from_env(),
            validator: ValidatorConfig::from_env(),
            events: EventConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
        }
    }

    /// Development preset: small cache, no background cleanup.
    pub fn development() -> Self {
        Self {
            store: StoreConfig::default().with_auto_cleanup(false),
            cache: CacheConfig::development(),
            telemetry: TelemetryConfig {
                log_filter: "debug".to_string(),
                json: false,
            },
            ..Self::default()
        }
    }

    /// Production preset: adaptive cache, JSON logs.
    pub fn production() -> Self {
        Self {
            cache: CacheConfig::production(),
            telemetry: TelemetryConfig {
                log_filter: "info".to_string(),
                json: true,
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.cache.validate()?;
        self.vault.validate()?;
        self.migration.validate()?;
        self.validator.validate()?;
        if self.migration.target_version < self.store.schema_version {
            return Err(invalid(
                "migration.target_version",
                self.migration.target_version,
                "must not be below store.schema_version",
            ));
        }
        Ok(())
    }
}

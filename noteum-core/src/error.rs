//! Error types for Noteum storage operations

use thiserror::Error;

/// Record Store and object store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Initialization failed: {reason}")]
    Initialization { reason: String },

    #[error("Schema verification failed, missing tables: {missing:?}")]
    SchemaVerification { missing: Vec<String> },

    #[error("Operation on {table} failed: {reason}")]
    OperationFailed {
        table: String,
        reason: String,
        retryable: bool,
    },

    #[error("Field {field} is not indexed on {table}")]
    NotIndexed { table: String, field: String },

    #[error("Serialization failed for {table}: {reason}")]
    Serialization { table: String, reason: String },

    #[error("Store is closed")]
    Closed,

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Substrings of underlying failures that are worth retrying.
const RETRYABLE_MARKERS: &[&str] = &[
    "lock", "busy", "quota", "full", "timeout", "timed out", "again",
];

impl StorageError {
    /// Build an `OperationFailed`, classifying the cause as retryable when it
    /// looks like contention, exhaustion or a timeout.
    pub fn operation_failed(table: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let lowered = reason.to_lowercase();
        let retryable = RETRYABLE_MARKERS.iter().any(|m| lowered.contains(m));
        StorageError::OperationFailed {
            table: table.into(),
            reason,
            retryable,
        }
    }

    /// Whether the caller may retry the failed call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::OperationFailed { retryable: true, .. })
    }

    /// Whether the error is fatal at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::Initialization { .. } | StorageError::SchemaVerification { .. }
        )
    }
}

/// Token vault errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("Token quota exceeded for owner {owner}: limit {limit}")]
    QuotaExceeded { owner: String, limit: usize },

    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    #[error("Token validation failed: {errors:?}")]
    InvalidToken { errors: Vec<String> },

    #[error("Batch operation {index} failed: {reason}")]
    BatchFailed { index: usize, reason: String },
}

/// Result of a best-effort rollback attached to a failed migration step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The step declared no rollback.
    NotAttempted,
    /// The rollback ran to completion.
    Succeeded,
    /// The rollback itself failed.
    Failed { reason: String },
}

impl std::fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackOutcome::NotAttempted => write!(f, "rollback not attempted"),
            RollbackOutcome::Succeeded => write!(f, "rolled back"),
            RollbackOutcome::Failed { reason } => write!(f, "rollback failed: {reason}"),
        }
    }
}

/// Migration subsystem errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("Invalid migration step {name}: {reason}")]
    InvalidStep { name: String, reason: String },

    #[error("Migration step already registered: {name}")]
    DuplicateStep { name: String },

    #[error("Downgrade from {current} to {target} is not supported")]
    Downgrade { current: u32, target: u32 },

    #[error("No migration step covers version {version} on the way to {target}")]
    PlanGap { version: u32, target: u32 },

    #[error("Migration step {step} failed: {reason} ({rollback})")]
    StepFailed {
        step: String,
        reason: String,
        rollback: RollbackOutcome,
    },

    #[error("Migrated data failed validation: {critical} critical, {major} major errors")]
    ValidationFailed { critical: usize, major: usize },

    #[error("Backup not found: {id}")]
    BackupNotFound { id: String },

    #[error("Backup {id} failed its checksum")]
    BackupCorrupted { id: String },
}

/// Change notification errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Maximum number of listeners ({limit}) exceeded")]
    ListenerLimit { limit: usize },

    #[error("Change notifier has been destroyed")]
    Destroyed,

    #[error("Invalid key pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all Noteum errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NoteumError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for Noteum operations.
pub type NoteumResult<T> = Result<T, NoteumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let busy = StorageError::operation_failed("tokens", "database is locked");
        assert!(busy.is_retryable());

        let full = StorageError::operation_failed("cache", "MDB_MAP_FULL: Environment mapsize limit reached");
        assert!(full.is_retryable());

        let corrupt = StorageError::operation_failed("tokens", "invalid page header");
        assert!(!corrupt.is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        let err = StorageError::SchemaVerification {
            missing: vec!["tokens".to_string()],
        };
        assert!(err.is_fatal());
        assert!(!StorageError::Closed.is_fatal());
    }

    #[test]
    fn test_step_failure_carries_rollback_outcome() {
        let err = MigrationError::StepFailed {
            step: "add_index".to_string(),
            reason: "boom".to_string(),
            rollback: RollbackOutcome::Failed {
                reason: "no undo".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("add_index"));
        assert!(msg.contains("rollback failed: no undo"));
    }

    #[test]
    fn test_master_error_conversion() {
        let err: NoteumError = VaultError::QuotaExceeded {
            owner: "u1".to_string(),
            limit: 2,
        }
        .into();
        assert!(matches!(err, NoteumError::Vault(VaultError::QuotaExceeded { .. })));
    }
}

//! Noteum Test Utilities
//!
//! Shared test infrastructure for the Noteum workspace:
//! - Proptest generators for records, values and cache workloads
//! - Fixtures for in-memory and LMDB-backed record stores
//! - Assertions for the error taxonomy

pub use noteum_core::{
    CacheRecord, EvictionStrategy, MetaKind, MetaRecord, NoteumConfig, NoteumError, NoteumResult,
    PreferenceRecord, RecordValue, SettingRecord, StoreConfig, TableName, TokenRecord, TokenType,
};
pub use noteum_storage::{LmdbObjectStore, MemoryObjectStore, RecordStore};

use std::sync::Arc;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Noteum types.

    use super::*;
    use proptest::prelude::*;

    // === Scalars ===

    /// Key matching the naming convention checked by the integrity pass.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_.:]{0,15}"
    }

    /// Owner identifier.
    pub fn arb_owner() -> impl Strategy<Value = String> {
        "user_[0-9]{1,4}"
    }

    /// Token-like string, long enough to pass length validation.
    pub fn arb_token_string() -> impl Strategy<Value = String> {
        "[A-Za-z0-9]{10,64}"
    }

    // === Enums ===

    pub fn arb_token_type() -> impl Strategy<Value = TokenType> {
        prop_oneof![
            Just(TokenType::Access),
            Just(TokenType::Refresh),
            Just(TokenType::Api),
            Just(TokenType::Unknown),
        ]
    }

    pub fn arb_table_name() -> impl Strategy<Value = TableName> {
        proptest::sample::select(TableName::ALL.to_vec())
    }

    /// Strategies with a fixed ordering (adaptive excluded).
    pub fn arb_fixed_strategy() -> impl Strategy<Value = EvictionStrategy> {
        prop_oneof![
            Just(EvictionStrategy::Lru),
            Just(EvictionStrategy::Lfu),
            Just(EvictionStrategy::Fifo),
        ]
    }

    // === Values ===

    /// Any serializable record value, nested up to two levels.
    pub fn arb_record_value() -> impl Strategy<Value = RecordValue> {
        let leaf = prop_oneof![
            ".{0,32}".prop_map(RecordValue::Text),
            (-1.0e9f64..1.0e9).prop_map(RecordValue::Number),
            any::<bool>().prop_map(RecordValue::Bool),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(RecordValue::Bytes),
        ];
        leaf.prop_recursive(2, 16, 4, |inner| {
            proptest::collection::btree_map("[a-z]{1,8}", inner, 0..4).prop_map(RecordValue::Map)
        })
    }

    // === Records ===

    pub fn arb_token_record() -> impl Strategy<Value = TokenRecord> {
        (arb_key(), arb_token_string(), proptest::option::of(arb_token_type())).prop_map(
            |(key, token, token_type)| {
                let record = TokenRecord::new(key, token);
                match token_type {
                    Some(token_type) => record.with_type(token_type),
                    None => record,
                }
            },
        )
    }

    pub fn arb_preference_record() -> impl Strategy<Value = PreferenceRecord> {
        (arb_key(), arb_record_value(), "[a-z]{2,8}")
            .prop_map(|(key, value, category)| PreferenceRecord::new(key, value, category))
    }

    pub fn arb_cache_record() -> impl Strategy<Value = CacheRecord> {
        (arb_key(), arb_record_value(), proptest::option::of("[a-z]{2,8}")).prop_map(|(key, value, source)| {
            let record = CacheRecord::new(key, value);
            match source {
                Some(source) => record.with_source(source),
                None => record,
            }
        })
    }

    // === Workloads ===

    /// One cache engine call.
    #[derive(Debug, Clone, PartialEq)]
    pub enum CacheOp {
        Set(String, u32),
        Get(String),
        Delete(String),
    }

    /// Operations over a small key space so that hits, overwrites and
    /// evictions all occur.
    pub fn arb_cache_ops(max_len: usize) -> impl Strategy<Value = Vec<CacheOp>> {
        let key = "k[0-9]{1,2}";
        let op = prop_oneof![
            5 => (key, any::<u32>()).prop_map(|(k, v)| CacheOp::Set(k, v)),
            3 => key.prop_map(CacheOp::Get),
            1 => key.prop_map(CacheOp::Delete),
        ];
        proptest::collection::vec(op, 1..max_len)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built stores and records for common scenarios.

    use super::*;
    use chrono::Duration as ChronoDuration;

    /// Store config without the background cleanup timer.
    pub fn test_store_config() -> StoreConfig {
        StoreConfig::default().with_auto_cleanup(false)
    }

    /// Development config with a cheap key derivation and no timers.
    pub fn test_config() -> NoteumConfig {
        let mut config = NoteumConfig::development();
        config.vault = config.vault.with_kdf(1, 8).with_auto_cleanup(false);
        config
    }

    /// Uninitialized in-memory record store.
    pub fn memory_store() -> RecordStore {
        RecordStore::new(Arc::new(MemoryObjectStore::new()), test_store_config())
    }

    /// Initialized in-memory record store.
    pub async fn initialized_memory_store() -> RecordStore {
        let store = memory_store();
        store.initialize().await.expect("initialize should succeed");
        store
    }

    pub fn temp_dir() -> tempfile::TempDir {
        tempfile::TempDir::new().expect("temp dir should be created")
    }

    /// Uninitialized LMDB record store inside `dir`.
    pub fn lmdb_store(dir: &tempfile::TempDir) -> RecordStore {
        let backend = LmdbObjectStore::open(dir.path(), 10).expect("LMDB should open");
        RecordStore::new(Arc::new(backend), test_store_config())
    }

    /// Access and refresh tokens for `owner`, stored under owner keys.
    pub fn owner_tokens(owner: &str) -> Vec<TokenRecord> {
        [TokenType::Access, TokenType::Refresh]
            .into_iter()
            .map(|token_type| {
                TokenRecord::new(format!("{owner}:{token_type}"), "a1B2c3D4e5F6g7H8i9J0")
                    .with_type(token_type)
                    .with_owner(owner)
            })
            .collect()
    }

    /// Token that expired an hour ago.
    pub fn expired_token(key: &str) -> TokenRecord {
        TokenRecord::new(key, "expired-token-value").with_expires_at(noteum_core::now() - ChronoDuration::hours(1))
    }

    /// One record in every table.
    pub async fn seed_every_table(store: &RecordStore) -> NoteumResult<()> {
        for token in owner_tokens("alice") {
            store.tokens().put(token).await?;
        }
        store.preferences().put(PreferenceRecord::new("ui.theme", "dark", "ui")).await?;
        store.settings().put(SettingRecord::new("editor.font", "mono", "editor")).await?;
        store
            .cache()
            .put(CacheRecord::new("feed.latest", "payload").with_source("api"))
            .await?;
        store
            .metadata()
            .put(MetaRecord::new("app.launches", 1.0, MetaKind::App))
            .await?;
        Ok(())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for the Noteum error taxonomy.

    use super::*;
    use noteum_core::{MigrationError, StorageError, VaultError};

    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &NoteumResult<T>) {
        match result {
            Err(NoteumError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_closed<T: std::fmt::Debug>(result: &NoteumResult<T>) {
        match result {
            Err(NoteumError::Storage(StorageError::Closed)) => {}
            other => panic!("Expected Closed error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_vault_error<T: std::fmt::Debug>(result: &NoteumResult<T>) {
        match result {
            Err(NoteumError::Vault(_)) => {}
            other => panic!("Expected Vault error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_quota_exceeded<T: std::fmt::Debug>(result: &NoteumResult<T>, owner: &str) {
        match result {
            Err(NoteumError::Vault(VaultError::QuotaExceeded { owner: o, .. })) => {
                assert_eq!(o, owner, "Wrong owner in QuotaExceeded error");
            }
            other => panic!("Expected QuotaExceeded for {owner}, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_migration_error<T: std::fmt::Debug>(result: &NoteumResult<T>) {
        match result {
            Err(NoteumError::Migration(_)) => {}
            other => panic!("Expected Migration error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_step_failed<T: std::fmt::Debug>(result: &NoteumResult<T>, step: &str) {
        match result {
            Err(NoteumError::Migration(MigrationError::StepFailed { step: s, .. })) => {
                assert_eq!(s, step, "Wrong step in StepFailed error");
            }
            other => panic!("Expected StepFailed for {step}, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &NoteumResult<T>) {
        match result {
            Err(NoteumError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

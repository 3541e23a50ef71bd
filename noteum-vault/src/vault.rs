//! Token vault over the Record Store's tokens table.
//!
//! Write path: validate, encrypt, enforce the owner quota, persist, cache.
//! Read path: cache, store, expiry check (expired tokens are deleted), decrypt,
//! cache. Plaintext only ever lives in the in-memory cache and is held there
//! as a secret.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use noteum_core::{
    NoteumResult, RecordValue, Timestamp, TokenRecord, TokenType, VaultConfig, VaultError,
};
use noteum_storage::{spawn_periodic, BackgroundTask, RecordStore, Transaction};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::time::Instant;

use crate::cipher::TokenCipher;
use crate::key::KdfParams;
use crate::validator::{TokenValidation, TokenValidator, ValidationPolicy};

/// Key of an owner-scoped token.
pub fn owner_token_key(owner_id: &str, token_type: TokenType) -> String {
    format!("{owner_id}:{}", token_type.as_str())
}

// ============================================================================
// OPTIONS AND RESULTS
// ============================================================================

/// Optional attributes of a stored token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenOptions {
    /// Absolute expiry; wins over `ttl`.
    pub expires_at: Option<Timestamp>,
    pub ttl: Option<Duration>,
    pub token_type: Option<TokenType>,
    pub owner_id: Option<String>,
}

impl TokenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_expires_at(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_type(mut self, token_type: TokenType) -> Self {
        self.token_type = Some(token_type);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }
}

/// One step of [`TokenVault::batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum TokenOperation {
    Set {
        key: String,
        token: String,
        options: TokenOptions,
    },
    Remove {
        key: String,
    },
}

impl TokenOperation {
    pub fn set(key: impl Into<String>, token: impl Into<String>, options: TokenOptions) -> Self {
        TokenOperation::Set {
            key: key.into(),
            token: token.into(),
            options,
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        TokenOperation::Remove { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            TokenOperation::Set { key, .. } | TokenOperation::Remove { key } => key,
        }
    }
}

/// Token attributes without the value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenMetadata {
    pub key: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub token_type: Option<TokenType>,
    pub owner_id: Option<String>,
    pub expired: bool,
}

/// Summary of the tokens table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultStats {
    pub total_tokens: usize,
    pub expired_tokens: usize,
    pub tokens_by_type: BTreeMap<String, usize>,
    pub tokens_by_owner: BTreeMap<String, usize>,
    pub average_age_ms: f64,
    /// Sum of key and stored value lengths.
    pub storage_size: u64,
    pub cached_tokens: usize,
    pub last_cleanup: Option<Timestamp>,
}

// ============================================================================
// VAULT
// ============================================================================

struct CachedToken {
    value: SecretString,
    cached_at: Instant,
    expires_at: Option<Timestamp>,
}

struct VaultInner {
    store: RecordStore,
    config: VaultConfig,
    cipher: Option<TokenCipher>,
    validator: TokenValidator,
    cache: Mutex<HashMap<String, CachedToken>>,
    last_cleanup: Mutex<Option<Timestamp>>,
    cleanup_task: Mutex<Option<BackgroundTask>>,
}

/// Encrypted, validated token storage. Cheap to clone.
#[derive(Clone)]
pub struct TokenVault {
    inner: Arc<VaultInner>,
}

impl TokenVault {
    /// Build a vault. With encryption enabled the key is derived from
    /// `passphrase`, or random for the lifetime of this vault when none is
    /// given.
    pub fn new(
        store: RecordStore,
        config: VaultConfig,
        passphrase: Option<SecretString>,
    ) -> NoteumResult<Self> {
        let cipher = if config.enable_encryption {
            Some(match passphrase {
                Some(passphrase) => TokenCipher::from_passphrase(passphrase, KdfParams::from(&config))?,
                None => TokenCipher::random()?,
            })
        } else {
            None
        };
        let validator = TokenValidator::new(ValidationPolicy::from(&config));

        Ok(Self {
            inner: Arc::new(VaultInner {
                store,
                config,
                cipher,
                validator,
                cache: Mutex::new(HashMap::new()),
                last_cleanup: Mutex::new(None),
                cleanup_task: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.inner.config
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.inner.validator
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Store a token, expiring after `ttl` or the configured default.
    pub async fn set_token(&self, key: &str, token: &str, ttl: Option<Duration>) -> NoteumResult<()> {
        let options = TokenOptions {
            ttl,
            ..TokenOptions::default()
        };
        self.set_token_with(key, token, options).await
    }

    /// Store a token with full metadata.
    pub async fn set_token_with(&self, key: &str, token: &str, options: TokenOptions) -> NoteumResult<()> {
        let record = self.prepare(key, token, &options)?;
        if let Some(owner) = &options.owner_id {
            QuotaLedger::default().admit(self, owner, key).await?;
        }

        let stored = self.inner.store.tokens().put(record).await?;
        self.cache_put(key, token, stored.expires_at);
        tracing::debug!(
            key,
            token = %TokenValidator::sanitize_for_logging(token),
            "Token stored"
        );
        Ok(())
    }

    /// Store a token under `"{owner}:{type}"`.
    pub async fn set_owner_token(
        &self,
        owner_id: &str,
        token_type: TokenType,
        token: &str,
        expires_at: Option<Timestamp>,
    ) -> NoteumResult<()> {
        let key = owner_token_key(owner_id, token_type);
        let options = TokenOptions {
            expires_at,
            token_type: Some(token_type),
            owner_id: Some(owner_id.to_string()),
            ttl: None,
        };
        self.set_token_with(&key, token, options).await
    }

    /// Remove a token. Returns whether it existed.
    pub async fn remove_token(&self, key: &str) -> NoteumResult<bool> {
        self.cache_remove(key);
        self.inner.store.tokens().delete(key).await
    }

    /// Remove every token. Returns how many were stored.
    pub async fn clear_tokens(&self) -> NoteumResult<usize> {
        self.cache_clear();
        let removed = self.inner.store.tokens().clear().await?;
        tracing::info!(removed, "Tokens cleared");
        Ok(removed)
    }

    /// Apply a list of sets and removes atomically. Any failure aborts the
    /// whole batch and nothing is written.
    pub async fn batch(&self, operations: Vec<TokenOperation>) -> NoteumResult<usize> {
        let mut tx = self.inner.store.transaction();
        let mut ledger = QuotaLedger::default();
        let mut staged = Vec::with_capacity(operations.len());

        for (index, op) in operations.iter().enumerate() {
            let expires_at = self.stage(&mut tx, &mut ledger, op).await.map_err(|e| {
                tracing::warn!(index, key = op.key(), error = %e, "Token batch aborted");
                VaultError::BatchFailed {
                    index,
                    reason: e.to_string(),
                }
            })?;
            staged.push(expires_at);
        }

        let committed = tx.commit().await?;
        for (op, expires_at) in operations.iter().zip(staged) {
            match op {
                TokenOperation::Set { key, token, .. } => self.cache_put(key, token, expires_at),
                TokenOperation::Remove { key } => self.cache_remove(key),
            }
        }
        tracing::debug!(operations = operations.len(), committed, "Token batch committed");
        Ok(committed)
    }

    /// Stage one operation. Returns the expiry of a staged set.
    async fn stage(
        &self,
        tx: &mut Transaction<'_>,
        ledger: &mut QuotaLedger,
        op: &TokenOperation,
    ) -> NoteumResult<Option<Timestamp>> {
        match op {
            TokenOperation::Set { key, token, options } => {
                let record = self.prepare(key, token, options)?;
                if let Some(owner) = &options.owner_id {
                    ledger.admit(self, owner, key).await?;
                } else {
                    ledger.release(key);
                }
                Ok(tx.put(record).await?.expires_at)
            }
            TokenOperation::Remove { key } => {
                ledger.release(key);
                tx.delete::<TokenRecord>(key).await?;
                Ok(None)
            }
        }
    }

    /// Validate and seal a token into a record ready to persist.
    fn prepare(&self, key: &str, token: &str, options: &TokenOptions) -> NoteumResult<TokenRecord> {
        if self.inner.config.enable_validation {
            let validation = self.inner.validator.validate(token, options.token_type);
            if !validation.valid {
                tracing::warn!(
                    key,
                    token = %TokenValidator::sanitize_for_logging(token),
                    errors = ?validation.errors,
                    "Token rejected by validation"
                );
                return Err(VaultError::InvalidToken {
                    errors: validation.errors,
                }
                .into());
            }
        }

        let value = match &self.inner.cipher {
            Some(cipher) => cipher.encrypt(token)?,
            None => token.to_string(),
        };

        let expires_at = options.expires_at.unwrap_or_else(|| {
            let ttl = options.ttl.unwrap_or_else(|| self.inner.config.default_expiration());
            noteum_core::now() + ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX)
        });

        let mut record = TokenRecord::new(key, value).with_expires_at(expires_at);
        record.token_type = options.token_type;
        record.owner_id = options.owner_id.clone();
        Ok(record)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Plaintext of a live token. Expired tokens are deleted and read as
    /// absent.
    pub async fn get_token(&self, key: &str) -> NoteumResult<Option<String>> {
        if let Some(token) = self.cache_get(key) {
            return Ok(Some(token));
        }

        let Some(record) = self.inner.store.tokens().get(key).await? else {
            return Ok(None);
        };
        if self.inner.validator.is_expired(&record, noteum_core::now()) {
            tracing::debug!(key, "Expired token removed on read");
            self.remove_token(key).await?;
            return Ok(None);
        }

        let token = self.open(&record)?;
        self.cache_put(key, &token, record.expires_at);
        Ok(Some(token))
    }

    /// Live tokens of an owner, keyed by token type.
    pub async fn get_owner_tokens(&self, owner_id: &str) -> NoteumResult<BTreeMap<String, String>> {
        let now = noteum_core::now();
        let records = self.inner.store.tokens().equals("ownerId", owner_id).await?;

        let mut tokens = BTreeMap::new();
        for record in records {
            if self.inner.validator.is_expired(&record, now) {
                continue;
            }
            let name = match record.token_type {
                Some(token_type) => token_type.as_str().to_string(),
                None => record
                    .key
                    .rsplit(':')
                    .next()
                    .unwrap_or(&record.key)
                    .to_string(),
            };
            tokens.insert(name, self.open(&record)?);
        }
        Ok(tokens)
    }

    /// Stored and not expired.
    pub async fn token_exists(&self, key: &str) -> NoteumResult<bool> {
        let record = self.inner.store.tokens().get(key).await?;
        Ok(record.is_some_and(|r| !self.inner.validator.is_expired(&r, noteum_core::now())))
    }

    /// Absent tokens count as expired.
    pub async fn is_token_expired(&self, key: &str) -> NoteumResult<bool> {
        let record = self.inner.store.tokens().get(key).await?;
        Ok(record.map_or(true, |r| self.inner.validator.is_expired(&r, noteum_core::now())))
    }

    /// Whether a live token expires within `threshold`.
    pub async fn needs_refresh(&self, key: &str, threshold: Duration) -> NoteumResult<bool> {
        let record = self.inner.store.tokens().get(key).await?;
        Ok(record.is_some_and(|r| {
            self.inner
                .validator
                .needs_refresh(&r, threshold, noteum_core::now())
        }))
    }

    pub async fn token_keys(&self) -> NoteumResult<Vec<String>> {
        self.inner.store.tokens().keys().await
    }

    pub async fn token_metadata(&self, key: &str) -> NoteumResult<Option<TokenMetadata>> {
        let now = noteum_core::now();
        let record = self.inner.store.tokens().get(key).await?;
        Ok(record.map(|r| TokenMetadata {
            expired: self.inner.validator.is_expired(&r, now),
            key: r.key,
            created_at: r.created_at,
            updated_at: r.updated_at,
            expires_at: r.expires_at,
            token_type: r.token_type,
            owner_id: r.owner_id,
        }))
    }

    /// Validate a token without storing it.
    pub fn validate_token(&self, token: &str, token_type: Option<TokenType>) -> TokenValidation {
        self.inner.validator.validate(token, token_type)
    }

    fn open(&self, record: &TokenRecord) -> NoteumResult<String> {
        let RecordValue::Text(stored) = &record.value else {
            return Err(VaultError::Decryption {
                reason: format!("token {} is not stored as text", record.key),
            }
            .into());
        };
        match &self.inner.cipher {
            Some(cipher) => Ok(cipher.decrypt(stored)?),
            None => Ok(stored.clone()),
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Delete tokens expired beyond the grace period. Returns the count.
    pub async fn cleanup_expired(&self) -> NoteumResult<usize> {
        let now = noteum_core::now();
        let expired: Vec<String> = self
            .inner
            .store
            .tokens()
            .all()
            .await?
            .into_iter()
            .filter(|r| self.inner.validator.is_expired(r, now))
            .map(|r| r.key)
            .collect();

        let removed = if expired.is_empty() {
            0
        } else {
            let removed = self.inner.store.tokens().bulk_delete(&expired).await?;
            for key in &expired {
                self.cache_remove(key);
            }
            removed
        };

        if let Ok(mut last) = self.inner.last_cleanup.lock() {
            *last = Some(now);
        }
        if removed > 0 {
            tracing::info!(removed, "Expired tokens cleaned up");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> NoteumResult<VaultStats> {
        let now = noteum_core::now();
        let records = self.inner.store.tokens().all().await?;

        let mut stats = VaultStats {
            total_tokens: records.len(),
            expired_tokens: 0,
            tokens_by_type: BTreeMap::new(),
            tokens_by_owner: BTreeMap::new(),
            average_age_ms: 0.0,
            storage_size: 0,
            cached_tokens: self.inner.cache.lock().map(|c| c.len()).unwrap_or(0),
            last_cleanup: self.inner.last_cleanup.lock().ok().and_then(|l| *l),
        };

        let mut total_age = 0i64;
        for record in &records {
            if self.inner.validator.is_expired(record, now) {
                stats.expired_tokens += 1;
            }
            let token_type = record.token_type.unwrap_or(TokenType::Unknown);
            *stats.tokens_by_type.entry(token_type.as_str().to_string()).or_insert(0) += 1;
            let owner = record.owner_id.clone().unwrap_or_else(|| "anonymous".to_string());
            *stats.tokens_by_owner.entry(owner).or_insert(0) += 1;

            total_age += (now - record.created_at).num_milliseconds();
            let value_len = record.value.as_text().map_or(0, str::len);
            stats.storage_size += (record.key.len() + value_len) as u64;
        }
        if !records.is_empty() {
            stats.average_age_ms = total_age as f64 / records.len() as f64;
        }
        Ok(stats)
    }

    /// Start the periodic expired-token sweep if enabled in the config.
    pub fn start_auto_cleanup(&self) {
        if !self.inner.config.enable_auto_cleanup {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("No tokio runtime; token cleanup not started");
            return;
        }
        let Ok(mut slot) = self.inner.cleanup_task.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        *slot = Some(spawn_periodic(
            "vault-cleanup",
            self.inner.config.cleanup_interval(),
            move || {
                let vault = upgrade(&weak);
                async move {
                    let Some(vault) = vault else {
                        return false;
                    };
                    if let Err(e) = vault.cleanup_expired().await {
                        tracing::error!(error = %e, "Automatic token cleanup failed");
                    }
                    true
                }
            },
        ));
    }

    /// Stop the cleanup task and drop cached plaintext.
    pub async fn shutdown(&self) {
        let task = self.inner.cleanup_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            task.stop().await;
        }
        self.cache_clear();
    }

    // ------------------------------------------------------------------------
    // In-memory cache
    // ------------------------------------------------------------------------

    /// Cached plaintext while both the cache TTL and the token are live.
    fn cache_get(&self, key: &str) -> Option<String> {
        if !self.inner.config.enable_cache {
            return None;
        }
        let grace = ChronoDuration::from_std(self.inner.config.grace_period()).unwrap_or(ChronoDuration::MAX);
        let now = noteum_core::now();
        let mut cache = self.inner.cache.lock().ok()?;
        let fresh = cache.get(key).map(|entry| {
            entry.cached_at.elapsed() < self.inner.config.cache_ttl()
                && !entry.expires_at.is_some_and(|at| at + grace < now)
        })?;
        if fresh {
            cache.get(key).map(|entry| entry.value.expose_secret().to_string())
        } else {
            cache.remove(key);
            None
        }
    }

    fn cache_put(&self, key: &str, token: &str, expires_at: Option<Timestamp>) {
        if !self.inner.config.enable_cache {
            return;
        }
        if let Ok(mut cache) = self.inner.cache.lock() {
            cache.insert(
                key.to_string(),
                CachedToken {
                    value: SecretString::from(token.to_string()),
                    cached_at: Instant::now(),
                    expires_at,
                },
            );
        }
    }

    fn cache_remove(&self, key: &str) {
        if let Ok(mut cache) = self.inner.cache.lock() {
            cache.remove(key);
        }
    }

    fn cache_clear(&self) {
        if let Ok(mut cache) = self.inner.cache.lock() {
            cache.clear();
        }
    }
}

fn upgrade(weak: &Weak<VaultInner>) -> Option<TokenVault> {
    weak.upgrade().map(|inner| TokenVault { inner })
}

impl std::fmt::Debug for TokenVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVault")
            .field("cipher", &self.inner.cipher)
            .field("config", &self.inner.config)
            .finish()
    }
}

// ============================================================================
// QUOTA
// ============================================================================

/// Per-owner key sets seen by one write, including staged batch changes.
#[derive(Default)]
struct QuotaLedger {
    owners: HashMap<String, BTreeSet<String>>,
    released: HashSet<String>,
}

impl QuotaLedger {
    /// Admit `key` for `owner`, failing when the owner is at its limit.
    /// Overwriting a key the owner already holds does not count twice.
    async fn admit(&mut self, vault: &TokenVault, owner: &str, key: &str) -> NoteumResult<()> {
        if !self.owners.contains_key(owner) {
            let held: BTreeSet<String> = vault
                .inner
                .store
                .tokens()
                .equals("ownerId", owner)
                .await?
                .into_iter()
                .map(|r| r.key)
                .filter(|k| !self.released.contains(k))
                .collect();
            self.owners.insert(owner.to_string(), held);
        }
        for (other, keys) in self.owners.iter_mut() {
            if other != owner {
                keys.remove(key);
            }
        }

        let limit = vault.inner.config.max_tokens_per_owner;
        let held = self.owners.entry(owner.to_string()).or_default();
        if !held.contains(key) && held.len() >= limit {
            tracing::warn!(owner, limit, "Token quota exceeded");
            return Err(VaultError::QuotaExceeded {
                owner: owner.to_string(),
                limit,
            }
            .into());
        }
        held.insert(key.to_string());
        self.released.remove(key);
        Ok(())
    }

    /// `key` no longer belongs to any owner.
    fn release(&mut self, key: &str) {
        self.released.insert(key.to_string());
        for keys in self.owners.values_mut() {
            keys.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TEST_KDF_PARAMS;
    use noteum_core::NoteumError;
    use noteum_test_utils::{fixtures, generators};
    use proptest::prelude::*;

    const T1: &str = "a1B2c3D4e5F6g7H8i9J0k1L2m3N4o5P6";
    const T2: &str = "Q7r8S9t0U1v2W3x4Y5z6A7b8C9d0E1f2";
    const T3: &str = "Zz9Yy8Xx7Ww6Vv5Uu4Tt3Ss2Rr1Qq0Pp";

    async fn store() -> RecordStore {
        fixtures::initialized_memory_store().await
    }

    fn config() -> VaultConfig {
        VaultConfig::default()
            .with_auto_cleanup(false)
            .with_kdf(TEST_KDF_PARAMS.iterations, TEST_KDF_PARAMS.memory_kib)
    }

    async fn vault(config: VaultConfig) -> TokenVault {
        TokenVault::new(store().await, config, None).expect("vault should build")
    }

    #[tokio::test]
    async fn test_set_get_round_trip_is_encrypted_at_rest() {
        let vault = vault(config()).await;
        vault.set_token("session", T1, None).await.expect("set should succeed");

        let stored = vault
            .store()
            .tokens()
            .get("session")
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_ne!(stored.value.as_text(), Some(T1));
        assert!(stored.expires_at.is_some());

        assert_eq!(vault.get_token("session").await.expect("get should succeed").as_deref(), Some(T1));
    }

    #[tokio::test]
    async fn test_read_without_cache_decrypts_from_store() {
        let vault = vault(config().with_cache(false)).await;
        vault.set_token("k", T2, None).await.expect("set should succeed");
        assert_eq!(vault.get_token("k").await.expect("get should succeed").as_deref(), Some(T2));
        assert_eq!(vault.stats().await.expect("stats should succeed").cached_tokens, 0);
    }

    #[tokio::test]
    async fn test_passphrase_vaults_share_tokens() {
        let store = store().await;
        let pass = || Some(SecretString::from("long passphrase".to_string()));
        let writer = TokenVault::new(store.clone(), config(), pass()).expect("vault should build");
        writer.set_token("shared", T1, None).await.expect("set should succeed");

        let reader = TokenVault::new(store.clone(), config().with_cache(false), pass()).expect("vault should build");
        assert_eq!(reader.get_token("shared").await.expect("get should succeed").as_deref(), Some(T1));

        let stranger = TokenVault::new(store, config().with_cache(false), None).expect("vault should build");
        let err = stranger.get_token("shared").await.expect_err("foreign key should fail");
        assert!(matches!(err, NoteumError::Vault(VaultError::Decryption { .. })));
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let vault = vault(config()).await;
        let err = vault.set_token("weak", "abc", None).await.expect_err("weak token should fail");
        assert!(matches!(err, NoteumError::Vault(VaultError::InvalidToken { .. })));
        assert!(vault.get_token("weak").await.expect("get should succeed").is_none());
    }

    #[tokio::test]
    async fn test_owner_quota() {
        let vault = vault(config().with_max_tokens_per_owner(2)).await;
        vault
            .set_owner_token("u", TokenType::Access, T1, None)
            .await
            .expect("first token should fit");
        vault
            .set_owner_token("u", TokenType::Refresh, T2, None)
            .await
            .expect("second token should fit");

        let err = vault
            .set_owner_token("u", TokenType::Api, T3, None)
            .await
            .expect_err("third token should exceed quota");
        assert!(matches!(
            err,
            NoteumError::Vault(VaultError::QuotaExceeded { ref owner, limit: 2 }) if owner == "u"
        ));

        // Replacing a held key is not a new token.
        vault
            .set_owner_token("u", TokenType::Access, T3, None)
            .await
            .expect("overwrite should succeed");
        // Other owners are unaffected.
        vault
            .set_owner_token("v", TokenType::Api, T3, None)
            .await
            .expect("other owner should succeed");

        let tokens = vault.get_owner_tokens("u").await.expect("owner tokens should load");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens.get("access").map(String::as_str), Some(T3));
        assert_eq!(tokens.get("refresh").map(String::as_str), Some(T2));
    }

    #[tokio::test]
    async fn test_expired_token_reads_absent_and_is_deleted() {
        let vault = vault(config()).await;
        let past = noteum_core::now() - ChronoDuration::hours(1);
        vault
            .set_token_with("old", T1, TokenOptions::new().with_expires_at(past))
            .await
            .expect("set should succeed");

        assert!(vault.is_token_expired("old").await.expect("check should succeed"));
        assert!(!vault.token_exists("old").await.expect("check should succeed"));
        assert!(vault.get_token("old").await.expect("get should succeed").is_none());
        assert!(vault.get_token("old").await.expect("get should succeed").is_none());
        assert!(vault.token_keys().await.expect("keys should load").is_empty());
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let vault = vault(config().with_max_tokens_per_owner(1)).await;
        vault.set_token("keep", T1, None).await.expect("set should succeed");

        let err = vault
            .batch(vec![
                TokenOperation::remove("keep"),
                TokenOperation::set("a", T2, TokenOptions::new().with_owner("u")),
                TokenOperation::set("b", T3, TokenOptions::new().with_owner("u")),
            ])
            .await
            .expect_err("second owner token should exceed quota");
        assert!(matches!(err, NoteumError::Vault(VaultError::BatchFailed { index: 2, .. })));
        assert!(vault.token_exists("keep").await.expect("check should succeed"));
        assert!(!vault.token_exists("a").await.expect("check should succeed"));

        let committed = vault
            .batch(vec![
                TokenOperation::remove("keep"),
                TokenOperation::set("a", T2, TokenOptions::new().with_owner("u")),
            ])
            .await
            .expect("batch should succeed");
        assert_eq!(committed, 2);
        assert!(!vault.token_exists("keep").await.expect("check should succeed"));
        assert_eq!(vault.get_token("a").await.expect("get should succeed").as_deref(), Some(T2));
    }

    #[tokio::test]
    async fn test_metadata_refresh_and_stats() {
        let vault = vault(config()).await;
        let soon = noteum_core::now() + ChronoDuration::minutes(2);
        vault
            .set_owner_token("u", TokenType::Access, T1, Some(soon))
            .await
            .expect("set should succeed");
        vault.set_token("plain", T2, None).await.expect("set should succeed");

        let meta = vault
            .token_metadata("u:access")
            .await
            .expect("metadata should load")
            .expect("metadata should exist");
        assert_eq!(meta.owner_id.as_deref(), Some("u"));
        assert_eq!(meta.token_type, Some(TokenType::Access));
        assert!(!meta.expired);

        let threshold = TokenValidator::default_refresh_threshold();
        assert!(vault.needs_refresh("u:access", threshold).await.expect("check should succeed"));
        assert!(!vault.needs_refresh("plain", threshold).await.expect("check should succeed"));

        let stats = vault.stats().await.expect("stats should succeed");
        assert_eq!(stats.total_tokens, 2);
        assert_eq!(stats.tokens_by_type.get("access"), Some(&1));
        assert_eq!(stats.tokens_by_type.get("unknown"), Some(&1));
        assert_eq!(stats.tokens_by_owner.get("anonymous"), Some(&1));
        assert!(stats.storage_size > 0);
    }

    #[tokio::test]
    async fn test_cleanup_respects_grace_period() {
        let vault = vault(config()).await;
        let now = noteum_core::now();
        vault
            .set_token_with("gone", T1, TokenOptions::new().with_expires_at(now - ChronoDuration::hours(1)))
            .await
            .expect("set should succeed");
        vault
            .set_token_with("grace", T2, TokenOptions::new().with_expires_at(now - ChronoDuration::minutes(1)))
            .await
            .expect("set should succeed");
        vault.set_token("live", T3, None).await.expect("set should succeed");

        assert_eq!(vault.cleanup_expired().await.expect("cleanup should succeed"), 1);
        let keys = vault.token_keys().await.expect("keys should load");
        assert_eq!(keys, vec!["grace".to_string(), "live".to_string()]);
        assert!(vault.stats().await.expect("stats should succeed").last_cleanup.is_some());
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let vault = vault(config()).await;
        vault.set_token("a", T1, None).await.expect("set should succeed");
        vault.set_token("b", T2, None).await.expect("set should succeed");

        assert!(vault.remove_token("a").await.expect("remove should succeed"));
        assert!(!vault.remove_token("a").await.expect("remove should succeed"));
        assert_eq!(vault.clear_tokens().await.expect("clear should succeed"), 1);
        assert!(vault.get_token("b").await.expect("get should succeed").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_cleanup_task() {
        let vault = vault(config().with_auto_cleanup(true)).await;
        let past = noteum_core::now() - ChronoDuration::hours(1);
        vault
            .set_token_with("gone", T1, TokenOptions::new().with_expires_at(past))
            .await
            .expect("set should succeed");

        vault.start_auto_cleanup();
        tokio::time::sleep(vault.config().cleanup_interval() + Duration::from_secs(1)).await;
        assert!(vault.token_keys().await.expect("keys should load").is_empty());
        vault.shutdown().await;
    }

    #[tokio::test]
    async fn test_plaintext_mode_without_encryption() {
        let vault = vault(config().with_encryption(false).with_validation(false)).await;
        vault.set_token("k", "x", None).await.expect("set should succeed");
        let stored = vault
            .store()
            .tokens()
            .get("k")
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(stored.value.as_text(), Some("x"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_owner_tokens_round_trip(
            owner in generators::arb_owner(),
            tokens in proptest::collection::btree_map(
                generators::arb_token_type(),
                generators::arb_token_string(),
                1..4,
            ),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime should build");
            runtime.block_on(async {
                let vault = vault(config().with_validation(false)).await;
                for (token_type, token) in &tokens {
                    vault
                        .set_owner_token(&owner, *token_type, token, None)
                        .await
                        .expect("set should succeed");
                }
                let fetched = vault.get_owner_tokens(&owner).await.expect("get should succeed");
                let expected: BTreeMap<String, String> = tokens
                    .iter()
                    .map(|(token_type, token)| (token_type.as_str().to_string(), token.clone()))
                    .collect();
                assert_eq!(fetched, expected);
            });
        }
    }
}

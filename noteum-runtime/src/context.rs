//! The storage context.
//!
//! One [`StorageContext`] per process owns the record store, the cache, the
//! token vault and the change notifier. It is opened once at startup and
//! handed to whatever needs storage; clones share the same components.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use noteum_core::{CacheRecord, NoteumConfig};
use noteum_events::ChangeNotifier;
use noteum_migrate::{IntegrityReport, MigrationRegistry, MigrationReport, MigrationStep, Migrator};
use noteum_storage::{
    CacheEngine, CachedRecordStore, LmdbObjectStore, MemoryObjectStore, ObjectStore, RecordStore,
};
use noteum_vault::TokenVault;
use secrecy::SecretString;

use crate::config::passphrase_from_env;
use crate::error::{RuntimeError, RuntimeResult};

/// Where records are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Process memory; contents are lost on teardown.
    Memory,
    /// LMDB environment in the given directory.
    Lmdb { path: PathBuf },
}

impl Backend {
    pub fn lmdb(path: impl Into<PathBuf>) -> Self {
        Backend::Lmdb { path: path.into() }
    }

    fn open(&self, config: &NoteumConfig) -> RuntimeResult<Arc<dyn ObjectStore>> {
        Ok(match self {
            Backend::Memory => Arc::new(MemoryObjectStore::new()),
            Backend::Lmdb { path } => Arc::new(
                LmdbObjectStore::open(path, config.store.map_size_mb).map_err(noteum_core::NoteumError::from)?,
            ),
        })
    }
}

/// Extra inputs for [`StorageContext::open_with`].
#[derive(Default)]
pub struct ContextOptions {
    steps: Vec<Arc<dyn MigrationStep>>,
    passphrase: Option<SecretString>,
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an application migration step next to the built-in ones.
    pub fn with_step<S: MigrationStep + 'static>(mut self, step: S) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn with_passphrase(mut self, passphrase: SecretString) -> Self {
        self.passphrase = Some(passphrase);
        self
    }
}

/// Explicit handle to every storage component.
#[derive(Clone)]
pub struct StorageContext {
    config: Arc<NoteumConfig>,
    notifier: ChangeNotifier,
    store: RecordStore,
    cache: CachedRecordStore,
    vault: TokenVault,
    migrator: Arc<Migrator>,
    migration: Arc<MigrationReport>,
    integrity: Arc<IntegrityReport>,
    torn_down: Arc<AtomicBool>,
}

impl StorageContext {
    /// Open with the built-in migrations and the passphrase from
    /// `NOTEUM_VAULT_PASSPHRASE`, if set.
    pub async fn open(config: NoteumConfig, backend: Backend) -> RuntimeResult<Self> {
        let mut options = ContextOptions::new();
        if let Some(passphrase) = passphrase_from_env() {
            options = options.with_passphrase(passphrase);
        }
        Self::open_with(config, backend, options).await
    }

    /// Bring every component up in dependency order: object store, record
    /// store, migrations, validation, cache, vault.
    pub async fn open_with(config: NoteumConfig, backend: Backend, options: ContextOptions) -> RuntimeResult<Self> {
        config.validate()?;

        let notifier = ChangeNotifier::new(config.events.clone());
        let object_store = backend.open(&config)?;
        let store = RecordStore::new(object_store, config.store.clone()).with_notifier(notifier.clone());
        store.initialize().await?;

        let mut registry = MigrationRegistry::with_defaults();
        for step in options.steps {
            registry.register_arc(step).map_err(noteum_core::NoteumError::from)?;
        }
        let migrator = Migrator::new(
            store.clone(),
            registry,
            config.migration.clone(),
            config.validator.clone(),
        );
        let migration = migrator.migrate().await?;

        let integrity = match &migration.validation {
            Some(report) => report.clone(),
            None => migrator.validator().check_integrity().await?,
        };
        if !integrity.is_valid {
            tracing::warn!(
                issues = integrity.issues.len(),
                recommendations = ?integrity.recommendations,
                "Store opened with integrity issues"
            );
        }

        let engine = CacheEngine::with_notifier(config.cache.clone(), notifier.clone());
        engine.start_background();
        let cache = CachedRecordStore::with_engine(store.clone(), engine);

        let vault = TokenVault::new(store.clone(), config.vault.clone(), options.passphrase)?;
        vault.start_auto_cleanup();

        tracing::info!(
            backend = store.object_store().backend(),
            schema_version = migration.final_version,
            migrations_applied = migration.applied.len(),
            cache_strategy = config.cache.strategy.as_str(),
            encryption = config.vault.enable_encryption,
            "Storage context opened"
        );

        Ok(Self {
            config: Arc::new(config),
            notifier,
            store,
            cache,
            vault,
            migrator: Arc::new(migrator),
            migration: Arc::new(migration),
            integrity: Arc::new(integrity),
            torn_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &NoteumConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn cache(&self) -> &CachedRecordStore {
        &self.cache
    }

    pub fn cache_engine(&self) -> &CacheEngine<CacheRecord> {
        self.cache.engine()
    }

    pub fn vault(&self) -> &TokenVault {
        &self.vault
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    /// What the startup migration did.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    /// Integrity pass taken at startup.
    pub fn integrity_report(&self) -> &IntegrityReport {
        &self.integrity
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Fails once the context has been torn down.
    pub fn ensure_open(&self) -> RuntimeResult<()> {
        if self.is_torn_down() {
            return Err(RuntimeError::TornDown);
        }
        Ok(())
    }

    /// Stop every timer, deliver pending change events and close the store.
    /// Idempotent; clones share the torn-down state.
    pub async fn teardown(&self) -> RuntimeResult<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.vault.shutdown().await;
        self.cache.engine().shutdown().await;
        self.cache.engine().clear();
        let flushed = self.notifier.flush();
        self.store.close().await?;
        self.notifier.destroy();

        tracing::info!(flushed_events = flushed, "Storage context torn down");
        Ok(())
    }
}

impl std::fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageContext")
            .field("backend", &self.store.object_store().backend())
            .field("schema_version", &self.migration.final_version)
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noteum_core::{CacheRecord, TokenType};
    use noteum_events::{ChangeEvent, ChangeObserver, SubscriptionOptions};
    use std::sync::Mutex;

    fn test_config() -> NoteumConfig {
        let mut config = NoteumConfig::development();
        config.vault = config.vault.with_kdf(1, 8).with_auto_cleanup(false);
        config
    }

    #[tokio::test]
    async fn test_open_runs_default_migration() {
        let ctx = StorageContext::open_with(test_config(), Backend::Memory, ContextOptions::new())
            .await
            .expect("context should open");

        assert_eq!(ctx.migration_report().final_version, 1);
        assert_eq!(ctx.migration_report().applied_names(), vec!["initial_schema"]);
        assert!(ctx.integrity_report().is_valid);
        assert_eq!(ctx.store().schema_version().await.expect("version should read"), 1);

        ctx.teardown().await.expect("teardown should succeed");
    }

    #[tokio::test]
    async fn test_components_share_the_store() {
        let ctx = StorageContext::open_with(
            test_config(),
            Backend::Memory,
            ContextOptions::new().with_passphrase(SecretString::from("context passphrase".to_string())),
        )
        .await
        .expect("context should open");

        ctx.vault()
            .set_owner_token("u1", TokenType::Access, "a1B2c3D4e5F6g7H8i9J0", None)
            .await
            .expect("token should store");
        assert_eq!(ctx.store().tokens().count().await.expect("count should succeed"), 1);

        ctx.cache()
            .set(CacheRecord::new("feed", "payload"))
            .await
            .expect("cache write should succeed");
        assert!(ctx.cache_engine().has("feed"));
        assert!(ctx.store().cache().get("feed").await.expect("read should succeed").is_some());

        ctx.teardown().await.expect("teardown should succeed");
    }

    struct Collect(Mutex<Vec<ChangeEvent>>);

    impl ChangeObserver for Collect {
        fn on_change(&self, event: &ChangeEvent) -> Result<(), String> {
            if let Ok(mut events) = self.0.lock() {
                events.push(event.clone());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_teardown_flushes_events_and_is_idempotent() {
        let ctx = StorageContext::open_with(test_config(), Backend::Memory, ContextOptions::new())
            .await
            .expect("context should open");
        let observer = Arc::new(Collect(Mutex::new(Vec::new())));
        ctx.notifier()
            .subscribe(observer.clone(), SubscriptionOptions::new().with_key_containing("lang"))
            .expect("subscribe should succeed");

        ctx.store()
            .settings()
            .put(noteum_core::SettingRecord::new("lang", "en", "app"))
            .await
            .expect("put should succeed");

        let clone = ctx.clone();
        ctx.teardown().await.expect("teardown should succeed");
        clone.teardown().await.expect("second teardown should succeed");

        assert!(clone.is_torn_down());
        assert!(matches!(clone.ensure_open(), Err(RuntimeError::TornDown)));
        assert!(ctx.store().is_closed());
        let events = observer.0.lock().map(|e| e.len()).unwrap_or(0);
        assert_eq!(events, 1);
    }
}

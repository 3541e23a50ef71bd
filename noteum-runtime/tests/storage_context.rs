//! End-to-end tests for the storage context over both backends.

use async_trait::async_trait;
use noteum_core::{NoteumResult, SettingRecord, TokenType};
use noteum_migrate::MigrationStep;
use noteum_runtime::{Backend, ContextOptions, RuntimeError, StorageContext};
use noteum_storage::RecordStore;
use noteum_test_utils::{assertions, fixtures};
use secrecy::SecretString;

const TOKEN: &str = "a1B2c3D4e5F6g7H8i9J0k1L2";

fn passphrase() -> SecretString {
    SecretString::from("integration passphrase".to_string())
}

/// Version 1 to 2: copies the theme preference into settings.
struct PromoteTheme;

#[async_trait]
impl MigrationStep for PromoteTheme {
    fn name(&self) -> &str {
        "promote_theme"
    }
    fn from_version(&self) -> u32 {
        1
    }
    fn to_version(&self) -> u32 {
        2
    }
    async fn migrate(&self, store: &RecordStore) -> NoteumResult<()> {
        if let Some(theme) = store.preferences().get("ui.theme").await? {
            store
                .settings()
                .put(SettingRecord::new("theme", theme.value, "ui"))
                .await?;
        }
        Ok(())
    }
}

/// Version 1 to 2 that always fails.
struct Broken;

#[async_trait]
impl MigrationStep for Broken {
    fn name(&self) -> &str {
        "broken"
    }
    fn from_version(&self) -> u32 {
        1
    }
    fn to_version(&self) -> u32 {
        2
    }
    async fn migrate(&self, _store: &RecordStore) -> NoteumResult<()> {
        Err(noteum_core::StorageError::operation_failed("settings", "unexpected layout").into())
    }
}

#[tokio::test]
async fn test_lmdb_context_survives_reopen() {
    let dir = fixtures::temp_dir();

    let ctx = StorageContext::open_with(
        fixtures::test_config(),
        Backend::lmdb(dir.path()),
        ContextOptions::new().with_passphrase(passphrase()),
    )
    .await
    .expect("context should open");
    fixtures::seed_every_table(ctx.store()).await.expect("seed should succeed");
    ctx.vault()
        .set_owner_token("alice", TokenType::Access, TOKEN, None)
        .await
        .expect("token should store");
    ctx.teardown().await.expect("teardown should succeed");
    drop(ctx);

    let mut config = fixtures::test_config();
    config.migration.target_version = 2;
    let ctx = StorageContext::open_with(
        config,
        Backend::lmdb(dir.path()),
        ContextOptions::new().with_passphrase(passphrase()).with_step(PromoteTheme),
    )
    .await
    .expect("context should reopen");

    assert_eq!(ctx.migration_report().from, 1);
    assert_eq!(ctx.migration_report().applied_names(), vec!["promote_theme"]);
    assert!(ctx.store().settings().get("theme").await.expect("read should succeed").is_some());

    // A new vault instance re-derives the key from the stored salt.
    let token = ctx
        .vault()
        .get_token("alice:access")
        .await
        .expect("read should succeed");
    assert_eq!(token.as_deref(), Some(TOKEN));

    ctx.teardown().await.expect("teardown should succeed");
}

#[tokio::test]
async fn test_failed_startup_migration_is_reported() {
    let mut config = fixtures::test_config();
    config.migration.target_version = 2;

    let result = StorageContext::open_with(config, Backend::Memory, ContextOptions::new().with_step(Broken)).await;
    match result {
        Err(RuntimeError::Noteum(err)) => assertions::assert_step_failed::<()>(&Err(err), "broken"),
        other => panic!("expected a failed step, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_opening() {
    let mut config = fixtures::test_config();
    config.vault.max_tokens_per_owner = 0;

    let result = StorageContext::open_with(config, Backend::Memory, ContextOptions::new()).await;
    assert!(matches!(result, Err(RuntimeError::Config(_))));
}

#[tokio::test]
async fn test_quota_through_context() {
    let mut config = fixtures::test_config();
    config.vault = config.vault.with_max_tokens_per_owner(2);
    let ctx = StorageContext::open_with(config, Backend::Memory, ContextOptions::new())
        .await
        .expect("context should open");

    let vault = ctx.vault();
    vault
        .set_owner_token("u", TokenType::Access, TOKEN, None)
        .await
        .expect("first token should store");
    vault
        .set_owner_token("u", TokenType::Refresh, TOKEN, None)
        .await
        .expect("second token should store");
    let third = vault.set_owner_token("u", TokenType::Api, TOKEN, None).await;
    assertions::assert_quota_exceeded(&third, "u");

    ctx.teardown().await.expect("teardown should succeed");
}

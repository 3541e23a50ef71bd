//! Migration steps and their registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use noteum_core::constants::DB_INITIALIZED_KEY;
use noteum_core::{MetaRecord, MigrationError, NoteumResult, RecordValue};
use noteum_storage::RecordStore;

/// One schema migration from `from_version` to `to_version`.
///
/// `migrate` may write to any table. The migrator commits the new version
/// only after it returns `Ok`; on error it calls `rollback` when
/// `has_rollback` is true.
#[async_trait]
pub trait MigrationStep: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn from_version(&self) -> u32;

    fn to_version(&self) -> u32;

    async fn migrate(&self, store: &RecordStore) -> NoteumResult<()>;

    fn has_rollback(&self) -> bool {
        false
    }

    /// Compensating action for a failed `migrate`.
    async fn rollback(&self, _store: &RecordStore) -> NoteumResult<()> {
        Ok(())
    }
}

/// Version 0 to 1: marks the database as initialized.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitialSchema;

#[async_trait]
impl MigrationStep for InitialSchema {
    fn name(&self) -> &str {
        "initial_schema"
    }

    fn description(&self) -> &str {
        "Initialize database schema"
    }

    fn from_version(&self) -> u32 {
        0
    }

    fn to_version(&self) -> u32 {
        1
    }

    async fn migrate(&self, store: &RecordStore) -> NoteumResult<()> {
        let now = noteum_core::now();
        store
            .metadata()
            .put(MetaRecord::system(DB_INITIALIZED_KEY, RecordValue::Number(now.timestamp_millis() as f64)))
            .await?;
        Ok(())
    }
}

/// Registered steps, indexed by name and by source version.
#[derive(Default, Clone)]
pub struct MigrationRegistry {
    steps: BTreeMap<String, Arc<dyn MigrationStep>>,
    by_version: BTreeMap<u32, Vec<Arc<dyn MigrationStep>>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in steps.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        // The built-in step is always valid and registered first.
        let _ = registry.register(InitialSchema);
        registry
    }

    pub fn register<S: MigrationStep + 'static>(&mut self, step: S) -> Result<(), MigrationError> {
        self.register_arc(Arc::new(step))
    }

    pub fn register_arc(&mut self, step: Arc<dyn MigrationStep>) -> Result<(), MigrationError> {
        let name = step.name().to_string();
        if name.trim().is_empty() {
            return Err(MigrationError::InvalidStep {
                name,
                reason: "name is required".to_string(),
            });
        }
        if step.from_version() >= step.to_version() {
            return Err(MigrationError::InvalidStep {
                name,
                reason: format!(
                    "to_version ({}) must be greater than from_version ({})",
                    step.to_version(),
                    step.from_version()
                ),
            });
        }
        if self.steps.contains_key(&name) {
            return Err(MigrationError::DuplicateStep { name });
        }

        tracing::debug!(
            step = %name,
            from = step.from_version(),
            to = step.to_version(),
            "Migration step registered"
        );
        self.by_version
            .entry(step.from_version())
            .or_default()
            .push(step.clone());
        self.steps.insert(name, step);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MigrationStep>> {
        self.steps.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Steps leaving `version`, in registration order.
    pub fn steps_from(&self, version: u32) -> &[Arc<dyn MigrationStep>] {
        self.by_version.get(&version).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every step, ordered by name.
    pub fn all(&self) -> Vec<Arc<dyn MigrationStep>> {
        self.steps.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Highest version any step reaches.
    pub fn latest_version(&self) -> u32 {
        self.steps.values().map(|s| s.to_version()).max().unwrap_or(0)
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

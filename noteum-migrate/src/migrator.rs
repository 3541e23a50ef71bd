//! Migration planning and execution.
//!
//! A run moves through `Planned -> Backing-up -> Applying[i] -> Validating ->
//! Committed`. The stored schema version is written after every step, so a
//! run interrupted half-way resumes from the last committed version. A
//! failing step is rolled back on its own; earlier steps stay committed.

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use noteum_core::constants::ESTIMATED_STEP_DURATION_MS;
use noteum_core::{
    MigrationConfig, MigrationError, NoteumResult, RollbackOutcome, TableName, Timestamp,
    ValidatorConfig,
};
use noteum_storage::{doc_size, RecordStore, TableSnapshot};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::registry::{MigrationRegistry, MigrationStep};
use crate::validator::{IntegrityReport, MigrationValidator, Severity};

// ============================================================================
// PLAN
// ============================================================================

/// Ordered steps from one version to another.
#[derive(Clone)]
pub struct MigrationPlan {
    pub from: u32,
    pub to: u32,
    pub steps: Vec<Arc<dyn MigrationStep>>,
    pub backup_recommended: bool,
    pub estimated_duration: Duration,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

impl std::fmt::Debug for MigrationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationPlan")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("steps", &self.step_names())
            .field("backup_recommended", &self.backup_recommended)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub name: String,
    pub from: u32,
    pub to: u32,
    pub duration: Duration,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    pub from: u32,
    pub applied: Vec<StepReport>,
    /// Steps already committed by an earlier run.
    pub skipped: Vec<String>,
    pub final_version: u32,
    pub backup_id: Option<Uuid>,
    pub validation: Option<IntegrityReport>,
}

impl MigrationReport {
    pub fn applied_names(&self) -> Vec<&str> {
        self.applied.iter().map(|s| s.name.as_str()).collect()
    }
}

// ============================================================================
// BACKUPS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupMetadata {
    pub total_records: usize,
    pub size_bytes: u64,
    pub tables: Vec<TableName>,
    /// Hex SHA-256 over every table, key and document.
    pub checksum: String,
}

/// Full snapshot of the store at one schema version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseBackup {
    pub id: Uuid,
    pub version: u32,
    pub created_at: Timestamp,
    pub tables: TableSnapshot,
    pub metadata: BackupMetadata,
}

impl DatabaseBackup {
    fn capture(tables: TableSnapshot, version: u32) -> Self {
        let total_records = tables.values().map(Vec::len).sum();
        let size_bytes = tables
            .values()
            .flatten()
            .map(|(key, doc)| key.len() as u64 + doc_size(doc))
            .sum();
        let metadata = BackupMetadata {
            total_records,
            size_bytes,
            tables: tables.keys().copied().collect(),
            checksum: checksum(&tables),
        };
        Self {
            id: Uuid::now_v7(),
            version,
            created_at: noteum_core::now(),
            tables,
            metadata,
        }
    }

    /// Whether the contents still match the recorded checksum.
    pub fn verify(&self) -> bool {
        checksum(&self.tables) == self.metadata.checksum
    }
}

fn checksum(tables: &TableSnapshot) -> String {
    let mut hasher = Sha256::new();
    for (table, rows) in tables {
        hasher.update(table.as_str().as_bytes());
        for (key, doc) in rows {
            hasher.update([0u8]);
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(doc.to_string().as_bytes());
        }
        hasher.update([0xffu8]);
    }
    hex::encode(hasher.finalize())
}

// ============================================================================
// MIGRATOR
// ============================================================================

/// Plans and applies schema migrations against a [`RecordStore`].
pub struct Migrator {
    store: RecordStore,
    registry: MigrationRegistry,
    config: MigrationConfig,
    validator: MigrationValidator,
    backups: RwLock<VecDeque<Arc<DatabaseBackup>>>,
}

impl Migrator {
    pub fn new(
        store: RecordStore,
        registry: MigrationRegistry,
        config: MigrationConfig,
        validator_config: ValidatorConfig,
    ) -> Self {
        let validator = MigrationValidator::new(store.clone(), validator_config);
        Self {
            store,
            registry,
            config,
            validator,
            backups: RwLock::new(VecDeque::new()),
        }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn validator(&self) -> &MigrationValidator {
        &self.validator
    }

    pub async fn current_version(&self) -> NoteumResult<u32> {
        self.store.schema_version().await
    }

    pub async fn needs_migration(&self) -> NoteumResult<bool> {
        Ok(self.current_version().await? < self.config.target_version)
    }

    /// Plan from the stored version to `target`.
    pub async fn plan(&self, target: u32) -> NoteumResult<MigrationPlan> {
        let current = self.current_version().await?;
        Ok(self.plan_from(current, target)?)
    }

    /// Breadth-first search over versions from `current` to `target`. The
    /// plan with the fewest steps wins; among equally short plans, longer
    /// jumps are explored first and the first registered step wins a tie.
    pub fn plan_from(&self, current: u32, target: u32) -> Result<MigrationPlan, MigrationError> {
        if target < current {
            return Err(MigrationError::Downgrade { current, target });
        }

        let mut reached_by: HashMap<u32, Arc<dyn MigrationStep>> = HashMap::new();
        let mut queue = VecDeque::from([current]);
        let mut furthest = current;
        while let Some(version) = queue.pop_front() {
            if version == target {
                break;
            }
            let mut candidates: Vec<&Arc<dyn MigrationStep>> = self
                .registry
                .steps_from(version)
                .iter()
                .filter(|s| s.to_version() <= target)
                .collect();
            // Stable, so registration order survives among equal jumps.
            candidates.sort_by_key(|s| Reverse(s.to_version()));
            for step in candidates {
                let next = step.to_version();
                if reached_by.contains_key(&next) {
                    continue;
                }
                furthest = furthest.max(next);
                reached_by.insert(next, Arc::clone(step));
                queue.push_back(next);
            }
        }

        let mut steps = Vec::new();
        let mut version = target;
        while version != current {
            let step = reached_by
                .get(&version)
                .ok_or(MigrationError::PlanGap { version: furthest, target })?;
            version = step.from_version();
            steps.push(Arc::clone(step));
        }
        steps.reverse();

        Ok(MigrationPlan {
            from: current,
            to: target,
            backup_recommended: !steps.is_empty(),
            estimated_duration: Duration::from_millis(ESTIMATED_STEP_DURATION_MS * steps.len() as u64),
            steps,
        })
    }

    /// Migrate to the configured target version.
    pub async fn migrate(&self) -> NoteumResult<MigrationReport> {
        self.migrate_to(self.config.target_version).await
    }

    pub async fn migrate_to(&self, target: u32) -> NoteumResult<MigrationReport> {
        let plan = self.plan(target).await?;
        self.execute(&plan).await
    }

    /// Apply a plan. Steps whose target version is already committed are
    /// skipped, so a plan can be re-executed after an interruption.
    pub async fn execute(&self, plan: &MigrationPlan) -> NoteumResult<MigrationReport> {
        let from = self.current_version().await?;
        let pending = plan.steps.iter().filter(|s| s.to_version() > from).count();

        tracing::info!(
            from,
            to = plan.to,
            steps = plan.steps.len(),
            pending,
            "Migration started"
        );

        let backup_id = if pending > 0 && plan.backup_recommended && self.config.create_backups {
            Some(self.create_backup().await?.id)
        } else {
            None
        };

        let mut applied = Vec::new();
        let mut skipped = Vec::new();
        for step in &plan.steps {
            let current = self.current_version().await?;
            if step.to_version() <= current {
                tracing::debug!(step = step.name(), current, "Migration step already committed");
                skipped.push(step.name().to_string());
                continue;
            }
            if step.from_version() != current {
                return Err(MigrationError::PlanGap {
                    version: current,
                    target: plan.to,
                }
                .into());
            }
            applied.push(self.apply(step.as_ref()).await?);
        }

        let final_version = self.current_version().await?;
        let validation = if self.config.validate_after && !applied.is_empty() {
            let report = self.validator.check_integrity().await?;
            if self.config.require_valid && !report.is_valid {
                tracing::error!(
                    version = final_version,
                    major = report.count(Severity::Major),
                    "Migrated data failed validation"
                );
                return Err(MigrationError::ValidationFailed {
                    critical: report.count(Severity::Critical),
                    major: report.count(Severity::Major),
                }
                .into());
            }
            Some(report)
        } else {
            None
        };

        tracing::info!(
            from,
            final_version,
            applied = applied.len(),
            skipped = skipped.len(),
            "Migration completed"
        );
        Ok(MigrationReport {
            from,
            applied,
            skipped,
            final_version,
            backup_id,
            validation,
        })
    }

    /// Run one step and commit its version, or roll it back.
    async fn apply(&self, step: &dyn MigrationStep) -> NoteumResult<StepReport> {
        let started = Instant::now();
        tracing::info!(
            step = step.name(),
            from = step.from_version(),
            to = step.to_version(),
            "Applying migration step"
        );

        if let Err(e) = step.migrate(&self.store).await {
            let rollback = self.roll_back(step).await;
            tracing::error!(
                step = step.name(),
                error = %e,
                rollback = %rollback,
                "Migration step failed"
            );
            return Err(MigrationError::StepFailed {
                step: step.name().to_string(),
                reason: e.to_string(),
                rollback,
            }
            .into());
        }

        self.store.set_schema_version(step.to_version()).await?;
        let duration = started.elapsed();
        tracing::info!(
            step = step.name(),
            version = step.to_version(),
            duration_ms = duration.as_millis() as u64,
            "Migration step committed"
        );
        Ok(StepReport {
            name: step.name().to_string(),
            from: step.from_version(),
            to: step.to_version(),
            duration,
        })
    }

    async fn roll_back(&self, step: &dyn MigrationStep) -> RollbackOutcome {
        if !step.has_rollback() {
            return RollbackOutcome::NotAttempted;
        }
        match step.rollback(&self.store).await {
            Ok(()) => {
                tracing::info!(step = step.name(), "Migration step rolled back");
                RollbackOutcome::Succeeded
            }
            Err(e) => {
                tracing::warn!(step = step.name(), error = %e, "Rollback failed");
                RollbackOutcome::Failed { reason: e.to_string() }
            }
        }
    }

    // ========================================================================
    // BACKUP AND RESTORE
    // ========================================================================

    /// Snapshot every table. The oldest backup is dropped once the ring is
    /// full.
    pub async fn create_backup(&self) -> NoteumResult<Arc<DatabaseBackup>> {
        let version = self.current_version().await?;
        let tables = self.store.snapshot().await?;
        let backup = Arc::new(DatabaseBackup::capture(tables, version));

        let mut backups = self.backups.write().await;
        backups.push_back(backup.clone());
        while backups.len() > self.config.max_backups.max(1) {
            backups.pop_front();
        }

        tracing::info!(
            backup_id = %backup.id,
            version,
            records = backup.metadata.total_records,
            size_bytes = backup.metadata.size_bytes,
            "Backup created"
        );
        Ok(backup)
    }

    /// Retained backups, oldest first.
    pub async fn list_backups(&self) -> Vec<Arc<DatabaseBackup>> {
        self.backups.read().await.iter().cloned().collect()
    }

    pub async fn latest_backup(&self) -> Option<Arc<DatabaseBackup>> {
        self.backups.read().await.back().cloned()
    }

    /// Replace every table with the backup's contents and reset the schema
    /// version to the backup's. Returns the number of restored records.
    pub async fn restore(&self, id: Uuid) -> NoteumResult<usize> {
        let backup = self
            .backups
            .read()
            .await
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| MigrationError::BackupNotFound { id: id.to_string() })?;

        if !backup.verify() {
            tracing::error!(backup_id = %id, "Backup checksum mismatch");
            return Err(MigrationError::BackupCorrupted { id: id.to_string() }.into());
        }

        let restored = self.store.restore_snapshot(&backup.tables, backup.version).await?;
        tracing::info!(backup_id = %id, version = backup.version, records = restored, "Backup restored");
        Ok(restored)
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

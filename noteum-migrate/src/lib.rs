//! Noteum Migrate - Schema Migrations
//!
//! Versioned migration steps, a [`Migrator`] that plans and applies them with
//! per-step version commits, a bounded ring of [`DatabaseBackup`]s, and the
//! [`MigrationValidator`] that re-checks migrated data.

pub mod migrator;
pub mod registry;
pub mod validator;

pub use migrator::{
    BackupMetadata, DatabaseBackup, MigrationPlan, MigrationReport, Migrator, StepReport,
};
pub use registry::{InitialSchema, MigrationRegistry, MigrationStep};
pub use validator::{
    BatchValidationResult, ErrorCode, IntegrityIssue, IntegrityReport, ItemValidation,
    MigrationValidator, Severity, ValidationIssue, ValidationItem, ValidationMethod,
    ValidationSummary, ValidationWarning, WarningCode,
};

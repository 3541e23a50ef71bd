//! Post-migration validation.
//!
//! [`MigrationValidator::validate_migration`] compares source items with
//! their migrated counterparts; [`MigrationValidator::check_integrity`] scans
//! every table for keys that break the naming convention or collide.
//!
//! A batch is valid iff it has no critical and no major errors. Minor errors
//! and warnings are informational.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use noteum_core::constants::{FULL_VALIDATION_LIMIT, SAMPLE_VALIDATION_LIMIT};
use noteum_core::{NoteumResult, Record, RecordValue, TableName, TokenRecord, ValidatorConfig};
use noteum_storage::{Document, RecordStore};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Keys are printable, start with an alphanumeric or underscore and use a
/// small set of separators.
static KEY_CONVENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.:@/+=-]{0,255}$").expect("valid key regex"));

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingData,
    DataMismatch,
    CorruptionDetected,
    SizeMismatch,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingData => "MISSING_DATA",
            ErrorCode::DataMismatch => "DATA_MISMATCH",
            ErrorCode::CorruptionDetected => "CORRUPTION_DETECTED",
            ErrorCode::SizeMismatch => "SIZE_MISMATCH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    CompatibilityIssue,
    TypeChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMethod {
    Full,
    Sample,
    Incremental,
}

impl ValidationMethod {
    /// Method for a batch of `len` items.
    pub fn for_len(len: usize) -> Self {
        if len <= FULL_VALIDATION_LIMIT {
            ValidationMethod::Full
        } else if len <= SAMPLE_VALIDATION_LIMIT {
            ValidationMethod::Sample
        } else {
            ValidationMethod::Incremental
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub code: ErrorCode,
    pub severity: Severity,
    pub key: String,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationWarning {
    pub code: WarningCode,
    pub key: String,
    pub message: String,
    pub suggestion: Option<String>,
}

/// Outcome for one source item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemValidation {
    pub key: String,
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationWarning>,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub warning_items: usize,
    pub critical: usize,
    pub major: usize,
    pub minor: usize,
    /// Percentage of valid items; 100 for an empty batch.
    pub success_rate: f64,
}

impl ValidationSummary {
    fn from_results(results: &[ItemValidation]) -> Self {
        let total = results.len();
        let valid = results.iter().filter(|r| r.is_valid).count();
        let count = |severity: Severity| {
            results
                .iter()
                .flat_map(|r| &r.errors)
                .filter(|e| e.severity == severity)
                .count()
        };
        Self {
            total,
            valid,
            invalid: total - valid,
            warning_items: results.iter().filter(|r| !r.warnings.is_empty()).count(),
            critical: count(Severity::Critical),
            major: count(Severity::Major),
            minor: count(Severity::Minor),
            success_rate: if total > 0 {
                valid as f64 / total as f64 * 100.0
            } else {
                100.0
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchValidationResult {
    pub is_valid: bool,
    pub method: ValidationMethod,
    pub results: Vec<ItemValidation>,
    pub summary: ValidationSummary,
    pub duration: Duration,
}

impl BatchValidationResult {
    /// Every error of the batch.
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.results.iter().flat_map(|r| &r.errors)
    }
}

/// A keyed value on either side of a migration.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationItem {
    pub key: String,
    pub value: RecordValue,
    /// Table-specific classification (token type, category, scope, ...).
    pub classification: Option<String>,
}

impl ValidationItem {
    pub fn new(key: impl Into<String>, value: impl Into<RecordValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            classification: None,
        }
    }

    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = Some(classification.into());
        self
    }

    pub fn from_record<R: Record>(record: &R) -> Self {
        Self::new(record.key(), record.value().clone())
    }

    pub fn from_token(record: &TokenRecord) -> Self {
        let item = Self::from_record(record);
        match record.token_type {
            Some(token_type) => item.with_classification(token_type.as_str()),
            None => item,
        }
    }

    /// Build from a raw stored document. `None` when the value does not
    /// decode.
    pub fn from_document(table: TableName, key: &str, doc: &Document) -> Option<Self> {
        let value: RecordValue = serde_json::from_value(doc.get("value")?.clone()).ok()?;
        let classification = doc
            .get(classification_field(table))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Some(Self {
            key: key.to_string(),
            value,
            classification,
        })
    }
}

fn classification_field(table: TableName) -> &'static str {
    match table {
        TableName::Tokens => "type",
        TableName::Preferences => "category",
        TableName::Settings => "scope",
        TableName::Cache => "source",
        TableName::Metadata => "kind",
    }
}

/// One finding of the integrity pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityIssue {
    pub table: TableName,
    pub code: ErrorCode,
    pub severity: Severity,
    pub keys: Vec<String>,
    pub message: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    /// No critical or major issues.
    pub is_valid: bool,
    pub issues: Vec<IntegrityIssue>,
    pub recommendations: Vec<String>,
    pub records_scanned: usize,
}

impl IntegrityReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct MigrationValidator {
    store: RecordStore,
    config: ValidatorConfig,
}

impl MigrationValidator {
    pub fn new(store: RecordStore, config: ValidatorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Compare `source` items with `target`. Without `target`, the migrated
    /// values are read from `table`.
    pub async fn validate_migration(
        &self,
        table: TableName,
        source: &[ValidationItem],
        target: Option<&[ValidationItem]>,
    ) -> NoteumResult<BatchValidationResult> {
        let started = Instant::now();
        let fetched;
        let target = match target {
            Some(target) => target,
            None => {
                fetched = self.fetch(table, source).await?;
                &fetched[..]
            }
        };
        let by_key: HashMap<&str, &ValidationItem> =
            target.iter().map(|item| (item.key.as_str(), item)).collect();

        let method = if self.config.sample_size == 0 {
            ValidationMethod::Full
        } else {
            ValidationMethod::for_len(source.len())
        };
        let results: Vec<ItemValidation> = self
            .select(source, method)
            .into_iter()
            .map(|item| self.validate_item(item, by_key.get(item.key.as_str()).copied()))
            .collect();

        let summary = ValidationSummary::from_results(&results);
        let result = BatchValidationResult {
            is_valid: summary.critical == 0 && summary.major == 0,
            method,
            results,
            summary,
            duration: started.elapsed(),
        };

        tracing::info!(
            table = %table,
            method = ?result.method,
            checked = result.summary.total,
            critical = result.summary.critical,
            major = result.summary.major,
            minor = result.summary.minor,
            valid = result.is_valid,
            "Migration validation completed"
        );
        Ok(result)
    }

    async fn fetch(&self, table: TableName, source: &[ValidationItem]) -> NoteumResult<Vec<ValidationItem>> {
        let mut items = Vec::with_capacity(source.len());
        for item in source {
            let Some(doc) = self.store.object_store().get(table, &item.key).await? else {
                continue;
            };
            match ValidationItem::from_document(table, &item.key, &doc) {
                Some(target) => items.push(target),
                None => tracing::warn!(table = %table, key = %item.key, "Stored value does not decode"),
            }
        }
        Ok(items)
    }

    /// Items checked for a given method.
    fn select<'a>(&self, source: &'a [ValidationItem], method: ValidationMethod) -> Vec<&'a ValidationItem> {
        match method {
            ValidationMethod::Full => source.iter().collect(),
            ValidationMethod::Sample => {
                let sample = self.sample_size(source.len());
                let step = (source.len() / sample).max(1);
                source.iter().step_by(step).take(sample).collect()
            }
            ValidationMethod::Incremental => {
                let sample = self.sample_size(source.len());
                let stride = self.config.incremental_stride.max(source.len() / sample).max(1);
                source.iter().step_by(stride).take(sample).collect()
            }
        }
    }

    fn sample_size(&self, len: usize) -> usize {
        self.config.sample_size.min(len).max(1)
    }

    /// Run every per-item check.
    pub fn validate_item(&self, source: &ValidationItem, target: Option<&ValidationItem>) -> ItemValidation {
        let key = source.key.clone();
        let size = payload_size(&source.value);
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let Some(target) = target else {
            errors.push(issue(
                ErrorCode::MissingData,
                Severity::Critical,
                &key,
                format!("Target not found for key: {key}"),
            ));
            return ItemValidation {
                key,
                is_valid: false,
                errors,
                warnings,
                size,
            };
        };

        let corrupted = self.config.check_corruption && {
            let before = errors.len();
            check_corruption(&key, &target.value, &mut errors);
            errors.len() > before
        };

        // A corrupted value is reported once, not again as a mismatch.
        if self.config.deep_validation && !corrupted && source.value != target.value {
            let mut mismatch = issue(
                ErrorCode::DataMismatch,
                Severity::Critical,
                &key,
                format!("Value mismatch for key: {key}"),
            );
            mismatch.expected = Some(source.value.kind().to_string());
            mismatch.actual = Some(target.value.kind().to_string());
            errors.push(mismatch);
        }

        if self.config.check_format {
            check_format(&key, &source.value, &target.value, &mut warnings);
        }

        check_classification(source, target, &mut warnings);

        let target_size = payload_size(&target.value);
        let drift = size.abs_diff(target_size);
        if drift > self.config.max_size_difference {
            let severity = if drift > self.config.max_size_difference * 2 {
                Severity::Major
            } else {
                Severity::Minor
            };
            let mut mismatch = issue(
                ErrorCode::SizeMismatch,
                severity,
                &key,
                format!("Size difference of {drift} bytes for key: {key}"),
            );
            mismatch.expected = Some(size.to_string());
            mismatch.actual = Some(target_size.to_string());
            errors.push(mismatch);
        }

        let is_valid = errors.iter().all(|e| e.severity == Severity::Minor);
        ItemValidation {
            key,
            is_valid,
            errors,
            warnings,
            size,
        }
    }

    // ========================================================================
    // INTEGRITY
    // ========================================================================

    /// Scan every table for orphaned and colliding keys.
    pub async fn check_integrity(&self) -> NoteumResult<IntegrityReport> {
        let mut issues = Vec::new();
        let mut records_scanned = 0;

        for table in TableName::ALL {
            let rows = self.store.object_store().scan(table).await?;
            records_scanned += rows.len();

            let orphaned: Vec<String> = rows
                .iter()
                .filter(|(key, doc)| is_orphaned(table, key, doc))
                .map(|(key, _)| key.clone())
                .collect();
            if !orphaned.is_empty() {
                issues.push(IntegrityIssue {
                    table,
                    code: ErrorCode::CorruptionDetected,
                    severity: Severity::Minor,
                    message: format!("Found {} orphaned keys in {table}", orphaned.len()),
                    keys: orphaned,
                    recommendation: "Clean up orphaned keys to improve storage efficiency".to_string(),
                });
            }

            let duplicates = case_collisions(rows.iter().map(|(key, _)| key.as_str()));
            if !duplicates.is_empty() {
                issues.push(IntegrityIssue {
                    table,
                    code: ErrorCode::CorruptionDetected,
                    severity: Severity::Major,
                    message: format!("Found {} duplicate keys in {table}", duplicates.len()),
                    keys: duplicates,
                    recommendation: "Remove duplicate keys to prevent data inconsistency".to_string(),
                });
            }
        }

        let mut recommendations: Vec<String> = Vec::new();
        for issue in &issues {
            if !recommendations.contains(&issue.recommendation) {
                recommendations.push(issue.recommendation.clone());
            }
        }

        let report = IntegrityReport {
            is_valid: issues.iter().all(|i| i.severity == Severity::Minor),
            issues,
            recommendations,
            records_scanned,
        };
        if report.is_valid {
            tracing::info!(records = records_scanned, issues = report.issues.len(), "Integrity check passed");
        } else {
            tracing::warn!(
                records = records_scanned,
                major = report.count(Severity::Major),
                "Integrity check found problems"
            );
        }
        Ok(report)
    }
}

// ============================================================================
// CHECKS
// ============================================================================

fn issue(code: ErrorCode, severity: Severity, key: &str, message: String) -> ValidationIssue {
    ValidationIssue {
        code,
        severity,
        key: key.to_string(),
        message,
        expected: None,
        actual: None,
    }
}

/// Bytes of the payload: raw length for text and blobs, JSON length otherwise.
fn payload_size(value: &RecordValue) -> usize {
    match value {
        RecordValue::Text(s) => s.len(),
        RecordValue::Bytes(b) => b.len(),
        other => other.encoded_len().unwrap_or(0),
    }
}

fn check_corruption(key: &str, value: &RecordValue, errors: &mut Vec<ValidationIssue>) {
    if contains_null_byte(value) {
        errors.push(issue(
            ErrorCode::CorruptionDetected,
            Severity::Major,
            key,
            format!("Null bytes detected in value: {key}"),
        ));
    }
    if !is_serializable(value) {
        errors.push(issue(
            ErrorCode::CorruptionDetected,
            Severity::Major,
            key,
            format!("Value contains non-serializable data: {key}"),
        ));
    }
}

fn contains_null_byte(value: &RecordValue) -> bool {
    match value {
        RecordValue::Text(s) => s.contains('\0'),
        RecordValue::Map(map) => map.iter().any(|(k, v)| k.contains('\0') || contains_null_byte(v)),
        _ => false,
    }
}

/// JSON cannot carry NaN or infinities.
fn is_serializable(value: &RecordValue) -> bool {
    match value {
        RecordValue::Number(n) => n.is_finite(),
        RecordValue::Map(map) => map.values().all(is_serializable),
        _ => true,
    }
}

fn check_format(key: &str, source: &RecordValue, target: &RecordValue, warnings: &mut Vec<ValidationWarning>) {
    let mut warn = |message: String, suggestion: &str| {
        warnings.push(ValidationWarning {
            code: WarningCode::CompatibilityIssue,
            key: key.to_string(),
            message,
            suggestion: Some(suggestion.to_string()),
        });
    };

    if is_structured(source) != is_structured(target) {
        warn(
            format!("Value changed between structured and opaque: {key}"),
            "Verify value format compatibility",
        );
        return;
    }
    if let (RecordValue::Text(a), RecordValue::Text(b)) = (source, target) {
        if looks_like_jwt(a) != looks_like_jwt(b) {
            warn(
                format!("Value format changed from JWT to non-JWT or vice versa: {key}"),
                "Verify token format compatibility",
            );
        }
        if is_base64(a) != is_base64(b) {
            warn(
                format!("Value encoding format changed: {key}"),
                "Verify value encoding compatibility",
            );
        }
    }
}

fn is_structured(value: &RecordValue) -> bool {
    matches!(value, RecordValue::Map(_))
}

fn looks_like_jwt(value: &str) -> bool {
    value.split('.').count() == 3
}

fn is_base64(value: &str) -> bool {
    !value.is_empty()
        && STANDARD
            .decode(value)
            .is_ok_and(|bytes| STANDARD.encode(bytes) == value)
}

fn check_classification(source: &ValidationItem, target: &ValidationItem, warnings: &mut Vec<ValidationWarning>) {
    let (Some(expected), Some(actual)) = (&source.classification, &target.classification) else {
        return;
    };
    if expected != actual && expected != "unknown" {
        warnings.push(ValidationWarning {
            code: WarningCode::TypeChanged,
            key: source.key.clone(),
            message: format!("Classification changed during migration: {}", source.key),
            suggestion: Some(format!("Expected: {expected}, Got: {actual}")),
        });
    }
}

/// Key breaks the naming convention, or an owner-scoped token is not stored
/// under `"{owner}:{type}"`.
fn is_orphaned(table: TableName, key: &str, doc: &Document) -> bool {
    if !KEY_CONVENTION.is_match(key) {
        return true;
    }
    if table == TableName::Tokens {
        if let Some(owner) = doc.get("ownerId").and_then(|v| v.as_str()) {
            let expected = match doc.get("type").and_then(|v| v.as_str()) {
                Some(token_type) => format!("{owner}:{token_type}"),
                None => return !key.starts_with(&format!("{owner}:")),
            };
            return key != expected;
        }
    }
    false
}

/// Keys equal to another key of the same table ignoring case.
fn case_collisions<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut groups: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for key in keys {
        groups.entry(key.to_lowercase()).or_default().push(key);
    }
    groups
        .into_values()
        .filter(|group| group.len() > 1)
        .flatten()
        .map(str::to_string)
        .collect()
}

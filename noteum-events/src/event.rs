//! Change event types.

use noteum_core::{RecordValue, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation a change event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Updated,
    Removed,
    Cleared,
}

impl ChangeType {
    pub const ALL: [ChangeType; 4] = [
        ChangeType::Added,
        ChangeType::Updated,
        ChangeType::Removed,
        ChangeType::Cleared,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Updated => "updated",
            ChangeType::Removed => "removed",
            ChangeType::Cleared => "cleared",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mutation observed on a store, cache or vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub key: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub old_value: Option<RecordValue>,
    pub new_value: Option<RecordValue>,
    pub timestamp: Timestamp,
    pub source: String,
    pub table: Option<TableName>,
}

impl ChangeEvent {
    pub fn new(key: impl Into<String>, change_type: ChangeType, source: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            change_type,
            old_value: None,
            new_value: None,
            timestamp: noteum_core::now(),
            source: source.into(),
            table: None,
        }
    }

    /// `Added` when there was no previous value, `Updated` otherwise.
    pub fn upsert(
        key: impl Into<String>,
        old_value: Option<RecordValue>,
        new_value: RecordValue,
        source: impl Into<String>,
    ) -> Self {
        let change_type = if old_value.is_some() {
            ChangeType::Updated
        } else {
            ChangeType::Added
        };
        Self::new(key, change_type, source)
            .with_old(old_value)
            .with_new(Some(new_value))
    }

    pub fn removed(key: impl Into<String>, old_value: Option<RecordValue>, source: impl Into<String>) -> Self {
        Self::new(key, ChangeType::Removed, source).with_old(old_value)
    }

    /// Whole-table or whole-cache clear. The key names what was cleared.
    pub fn cleared(scope: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(scope, ChangeType::Cleared, source)
    }

    pub fn with_old(mut self, old_value: Option<RecordValue>) -> Self {
        self.old_value = old_value;
        self
    }

    pub fn with_new(mut self, new_value: Option<RecordValue>) -> Self {
        self.new_value = new_value;
        self
    }

    pub fn with_table(mut self, table: TableName) -> Self {
        self.table = Some(table);
        self
    }

    /// Fold a later event for the same `(table, key, type)` into this one: the
    /// original `old_value` survives, everything else comes from `later`.
    pub fn coalesce(self, later: ChangeEvent) -> ChangeEvent {
        ChangeEvent {
            old_value: self.old_value,
            ..later
        }
    }
}

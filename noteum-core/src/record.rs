//! Record data model
//!
//! Five tables hold five record shapes. Every record carries a unique key,
//! a [`RecordValue`] payload and creation/update timestamps; the specialised
//! fields differ per table. Timestamps are persisted as epoch milliseconds so
//! that range queries compare numerically.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

// ============================================================================
// VALUES
// ============================================================================

/// Closed set of serializable record payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Map(BTreeMap<String, RecordValue>),
    Bytes(Vec<u8>),
}

impl RecordValue {
    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RecordValue::Text(_) => "text",
            RecordValue::Number(_) => "number",
            RecordValue::Bool(_) => "bool",
            RecordValue::Map(_) => "map",
            RecordValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RecordValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Serialized JSON size of the payload, if it can be serialized.
    pub fn encoded_len(&self) -> Option<usize> {
        serde_json::to_vec(self).ok().map(|v| v.len())
    }

    /// Build a map value from key/value pairs.
    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, RecordValue)>,
        K: Into<String>,
    {
        RecordValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<&str> for RecordValue {
    fn from(s: &str) -> Self {
        RecordValue::Text(s.to_string())
    }
}

impl From<String> for RecordValue {
    fn from(s: String) -> Self {
        RecordValue::Text(s)
    }
}

impl From<f64> for RecordValue {
    fn from(n: f64) -> Self {
        RecordValue::Number(n)
    }
}

impl From<bool> for RecordValue {
    fn from(b: bool) -> Self {
        RecordValue::Bool(b)
    }
}

impl From<Vec<u8>> for RecordValue {
    fn from(b: Vec<u8>) -> Self {
        RecordValue::Bytes(b)
    }
}

// ============================================================================
// TABLES AND ENUMS
// ============================================================================

/// The five persisted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    Tokens,
    Preferences,
    Settings,
    Cache,
    Metadata,
}

impl TableName {
    pub const ALL: [TableName; 5] = [
        TableName::Tokens,
        TableName::Preferences,
        TableName::Settings,
        TableName::Cache,
        TableName::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Tokens => "tokens",
            TableName::Preferences => "preferences",
            TableName::Settings => "settings",
            TableName::Cache => "cache",
            TableName::Metadata => "metadata",
        }
    }

    pub fn parse(name: &str) -> Option<TableName> {
        TableName::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a stored token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    Api,
    Unknown,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
            TokenType::Api => "api",
            TokenType::Unknown => "unknown",
        }
    }

    /// Lenient parse; anything unrecognised is `Unknown`.
    pub fn parse(s: &str) -> TokenType {
        match s.to_ascii_lowercase().as_str() {
            "access" => TokenType::Access,
            "refresh" => TokenType::Refresh,
            "api" => TokenType::Api,
            _ => TokenType::Unknown,
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaKind {
    System,
    User,
    App,
    Debug,
}

// ============================================================================
// RECORD TRAIT
// ============================================================================

/// A typed record belonging to exactly one table.
///
/// `stamp` is the lifecycle hook run by the Record Store before every write:
/// it receives the current time and the record already stored under the same
/// key (if any) and must leave `updated_at >= created_at`.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: TableName;

    fn key(&self) -> &str;
    fn value(&self) -> &RecordValue;
    fn created_at(&self) -> Timestamp;
    fn updated_at(&self) -> Timestamp;

    /// Expiration instant, for tables that expire.
    fn expires_at(&self) -> Option<Timestamp> {
        None
    }

    fn stamp(&mut self, now: Timestamp, existing: Option<&Self>);
}

macro_rules! record_accessors {
    () => {
        fn key(&self) -> &str {
            &self.key
        }
        fn value(&self) -> &RecordValue {
            &self.value
        }
        fn created_at(&self) -> Timestamp {
            self.created_at
        }
        fn updated_at(&self) -> Timestamp {
            self.updated_at
        }
    };
}

/// Store-owned stamping shared by the preference, setting, cache and metadata
/// tables: `updated_at` always comes from the store clock and `created_at`
/// survives updates.
fn stamp_updated(
    created_at: &mut Timestamp,
    updated_at: &mut Timestamp,
    now: Timestamp,
    existing_created: Option<Timestamp>,
) {
    *created_at = existing_created.unwrap_or(now);
    *updated_at = now.max(*created_at);
}

/// Authentication token record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub key: String,
    pub value: RecordValue,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: Timestamp,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub expires_at: Option<Timestamp>,
    #[serde(rename = "type", default)]
    pub token_type: Option<TokenType>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl TokenRecord {
    pub fn new(key: impl Into<String>, value: impl Into<RecordValue>) -> Self {
        let now = crate::now();
        Self {
            key: key.into(),
            value: value.into(),
            created_at: now,
            updated_at: now,
            expires_at: None,
            token_type: None,
            owner_id: None,
        }
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

impl Record for TokenRecord {
    const TABLE: TableName = TableName::Tokens;
    record_accessors!();

    fn expires_at(&self) -> Option<Timestamp> {
        self.expires_at
    }

    /// Tokens keep the creation time of the first write.
    fn stamp(&mut self, now: Timestamp, existing: Option<&Self>) {
        stamp_updated(
            &mut self.created_at,
            &mut self.updated_at,
            now,
            existing.map(|e| e.created_at),
        );
    }
}

/// Per-owner user preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceRecord {
    pub key: String,
    pub value: RecordValue,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: Timestamp,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub category: String,
    #[serde(default)]
    pub is_global: bool,
}

impl PreferenceRecord {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<RecordValue>,
        category: impl Into<String>,
    ) -> Self {
        let now = crate::now();
        Self {
            key: key.into(),
            value: value.into(),
            created_at: now,
            updated_at: now,
            owner_id: None,
            category: category.into(),
            is_global: false,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn global(mut self) -> Self {
        self.is_global = true;
        self
    }
}

impl Record for PreferenceRecord {
    const TABLE: TableName = TableName::Preferences;
    record_accessors!();

    fn stamp(&mut self, now: Timestamp, existing: Option<&Self>) {
        stamp_updated(
            &mut self.created_at,
            &mut self.updated_at,
            now,
            existing.map(|e| e.created_at),
        );
    }
}

/// Application setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingRecord {
    pub key: String,
    pub value: RecordValue,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: Timestamp,
    pub scope: String,
    #[serde(default)]
    pub requires_restart: bool,
}

impl SettingRecord {
    pub fn new(key: impl Into<String>, value: impl Into<RecordValue>, scope: impl Into<String>) -> Self {
        let now = crate::now();
        Self {
            key: key.into(),
            value: value.into(),
            created_at: now,
            updated_at: now,
            scope: scope.into(),
            requires_restart: false,
        }
    }

    pub fn requiring_restart(mut self) -> Self {
        self.requires_restart = true;
        self
    }
}

impl Record for SettingRecord {
    const TABLE: TableName = TableName::Settings;
    record_accessors!();

    fn stamp(&mut self, now: Timestamp, existing: Option<&Self>) {
        stamp_updated(
            &mut self.created_at,
            &mut self.updated_at,
            now,
            existing.map(|e| e.created_at),
        );
    }
}

/// Cached API response or derived data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub key: String,
    pub value: RecordValue,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: Timestamp,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub expires_at: Option<Timestamp>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hit_count: Option<u64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CacheRecord {
    pub fn new(key: impl Into<String>, value: impl Into<RecordValue>) -> Self {
        let now = crate::now();
        Self {
            key: key.into(),
            value: value.into(),
            created_at: now,
            updated_at: now,
            expires_at: None,
            size: None,
            hit_count: None,
            source: None,
            tags: Vec::new(),
        }
    }

    pub fn with_expires_at(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

impl Record for CacheRecord {
    const TABLE: TableName = TableName::Cache;
    record_accessors!();

    fn expires_at(&self) -> Option<Timestamp> {
        self.expires_at
    }

    fn stamp(&mut self, now: Timestamp, existing: Option<&Self>) {
        stamp_updated(
            &mut self.created_at,
            &mut self.updated_at,
            now,
            existing.map(|e| e.created_at),
        );
        if self.size.is_none() {
            self.size = self.value.encoded_len().map(|n| n as u64);
        }
    }
}

/// Metadata record; also holds the schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRecord {
    pub key: String,
    pub value: RecordValue,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: Timestamp,
    pub kind: MetaKind,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub readonly: bool,
}

impl MetaRecord {
    pub fn new(key: impl Into<String>, value: impl Into<RecordValue>, kind: MetaKind) -> Self {
        let now = crate::now();
        Self {
            key: key.into(),
            value: value.into(),
            created_at: now,
            updated_at: now,
            kind,
            version: None,
            readonly: false,
        }
    }

    pub fn system(key: impl Into<String>, value: impl Into<RecordValue>) -> Self {
        Self::new(key, value, MetaKind::System)
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
}

impl Record for MetaRecord {
    const TABLE: TableName = TableName::Metadata;
    record_accessors!();

    fn stamp(&mut self, now: Timestamp, existing: Option<&Self>) {
        stamp_updated(
            &mut self.created_at,
            &mut self.updated_at,
            now,
            existing.map(|e| e.created_at),
        );
    }
}

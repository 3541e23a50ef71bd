//! Versioned Record Store.
//!
//! Typed tables over an [`ObjectStore`]. The store owns schema verification,
//! lifecycle hooks (timestamp stamping through [`Record::stamp`]), cleanup
//! sweeps, sampled statistics and the schema-version metadata record.
//!
//! # Lifecycle
//!
//! ```text
//! new ──▶ initialize ──▶ (operations, auto cleanup) ──▶ close
//!            │
//!            └─ SchemaVerification error if a table is missing
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use noteum_core::constants::{
    DB_CLOSED_KEY, DB_INITIALIZED_KEY, SCHEMA_VERSION_KEY, STATS_SAMPLE_SIZE,
};
use noteum_core::{
    MetaRecord, NoteumError, NoteumResult, Record, RecordValue, StorageError, StoreConfig,
    TableName, Timestamp,
};
use noteum_events::{ChangeEvent, ChangeNotifier};
use serde::Serialize;
use serde_json::Value;

use crate::object_store::{Document, ObjectStore, Query, WriteBatch};
use crate::schema::Schema;
use crate::task::{spawn_periodic, BackgroundTask};

/// Event source name for Record Store mutations.
pub const RECORD_STORE_SOURCE: &str = "record_store";

/// Raw contents of every table, keyed by record key.
pub type TableSnapshot = BTreeMap<TableName, Vec<(String, Document)>>;

// ============================================================================
// STATISTICS AND CLEANUP TYPES
// ============================================================================

/// Per-table statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub count: usize,
    /// Mean size of a sample of records times the count.
    pub estimated_bytes: u64,
}

/// Store-wide statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub db_name: String,
    pub backend: &'static str,
    pub schema_version: u32,
    pub tables: BTreeMap<TableName, TableStats>,
    pub total_records: usize,
    pub total_bytes: u64,
    pub last_cleanup: Option<Timestamp>,
}

/// Options for [`RecordStore::cleanup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Compute the candidate set without deleting.
    pub dry_run: bool,
    /// Cache records not updated within this many hours are removed.
    /// `None` uses the store configuration.
    pub max_age_hours: Option<u64>,
    /// Tables to sweep. Only tokens and cache expire.
    pub tables: Vec<TableName>,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_age_hours: None,
            tables: vec![TableName::Tokens, TableName::Cache],
        }
    }
}

impl CleanupOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn with_max_age_hours(mut self, hours: u64) -> Self {
        self.max_age_hours = Some(hours);
        self
    }

    pub fn with_tables(mut self, tables: &[TableName]) -> Self {
        self.tables = tables.to_vec();
        self
    }
}

/// Outcome of a cleanup sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupResult {
    pub dry_run: bool,
    pub records_removed: usize,
    pub breakdown: BTreeMap<TableName, usize>,
    /// Removed keys per table (candidates in a dry run).
    pub keys: BTreeMap<TableName, Vec<String>>,
    pub space_freed: u64,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct StoreState {
    initialized: bool,
    closed: bool,
    last_cleanup: Option<Timestamp>,
}

// ============================================================================
// RECORD STORE
// ============================================================================

/// Versioned, table-based persistence layer. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn ObjectStore>,
    schema: Arc<Schema>,
    config: Arc<StoreConfig>,
    notifier: Option<ChangeNotifier>,
    state: Arc<RwLock<StoreState>>,
    cleanup_task: Arc<tokio::sync::Mutex<Option<BackgroundTask>>>,
}

impl RecordStore {
    pub fn new(store: Arc<dyn ObjectStore>, config: StoreConfig) -> Self {
        let schema = Schema::noteum().with_version(config.schema_version);
        Self {
            store,
            schema: Arc::new(schema),
            config: Arc::new(config),
            notifier: None,
            state: Arc::new(RwLock::new(StoreState::default())),
            cleanup_task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Publish every mutation to `notifier`.
    pub fn with_notifier(mut self, notifier: ChangeNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Arc::new(schema);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn notifier(&self) -> Option<&ChangeNotifier> {
        self.notifier.as_ref()
    }

    /// The underlying object store.
    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Verify the schema, record initialization and start the cleanup timer.
    ///
    /// Failures are fatal: `StorageError::Initialization` if the store cannot
    /// be reached, `StorageError::SchemaVerification` if a table is missing.
    /// Calling it again on an initialized store is a no-op.
    pub async fn initialize(&self) -> NoteumResult<()> {
        {
            let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
            if state.closed {
                return Err(StorageError::Closed.into());
            }
            if state.initialized {
                return Ok(());
            }
        }

        self.verify_schema().await?;

        let marker = MetaRecord::system(DB_INITIALIZED_KEY, noteum_core::now().to_rfc3339());
        self.metadata().put(marker).await.map_err(|e| {
            NoteumError::from(StorageError::Initialization {
                reason: e.to_string(),
            })
        })?;

        {
            let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
            state.initialized = true;
        }

        if self.config.auto_cleanup {
            self.start_auto_cleanup().await;
        }

        tracing::info!(
            db = %self.schema.name,
            backend = self.store.backend(),
            schema_version = self.schema.version,
            auto_cleanup = self.config.auto_cleanup,
            "Record store initialized"
        );
        Ok(())
    }

    /// Check that every declared table exists in the underlying store.
    pub async fn verify_schema(&self) -> NoteumResult<()> {
        let present = self.store.table_names().await.map_err(|e| match e {
            NoteumError::Storage(StorageError::Closed) => NoteumError::from(StorageError::Closed),
            other => StorageError::Initialization {
                reason: other.to_string(),
            }
            .into(),
        })?;
        let missing = self.schema.missing_tables(&present);
        if !missing.is_empty() {
            tracing::error!(missing = ?missing, "Schema verification failed");
            return Err(StorageError::SchemaVerification { missing }.into());
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().map(|s| s.initialized).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().map(|s| s.closed).unwrap_or(true)
    }

    /// Stop background work, record the close and release the store.
    /// Idempotent.
    pub async fn close(&self) -> NoteumResult<()> {
        if self.is_closed() {
            return Ok(());
        }

        if let Some(task) = self.cleanup_task.lock().await.take() {
            task.stop().await;
        }

        let marker = MetaRecord::system(DB_CLOSED_KEY, noteum_core::now().to_rfc3339());
        if let Err(e) = self.metadata().put(marker).await {
            tracing::warn!(error = %e, "Failed to record store close");
        }

        self.store.close().await?;
        {
            let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
            state.closed = true;
        }
        tracing::info!(db = %self.schema.name, "Record store closed");
        Ok(())
    }

    async fn start_auto_cleanup(&self) {
        let mut slot = self.cleanup_task.lock().await;
        if slot.is_some() {
            return;
        }
        let store = self.clone();
        let task = spawn_periodic("record-store-cleanup", self.config.cleanup_interval(), move || {
            let store = store.clone();
            async move {
                if store.is_closed() {
                    return false;
                }
                match store.cleanup(CleanupOptions::default()).await {
                    Ok(result) => tracing::debug!(
                        removed = result.records_removed,
                        space_freed = result.space_freed,
                        "Automatic cleanup finished"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Automatic cleanup failed"),
                }
                true
            }
        });
        *slot = Some(task);
    }

    fn ensure_open(&self) -> NoteumResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed.into());
        }
        Ok(())
    }

    pub(crate) fn emit(&self, table: TableName, event: ChangeEvent) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(event.with_table(table));
        }
    }

    // ========================================================================
    // TABLE ACCESS
    // ========================================================================

    /// Typed accessor for the table of `R`.
    pub fn table<R: Record>(&self) -> Table<'_, R> {
        Table {
            store: self,
            _marker: PhantomData,
        }
    }

    pub fn tokens(&self) -> Table<'_, noteum_core::TokenRecord> {
        self.table()
    }

    pub fn preferences(&self) -> Table<'_, noteum_core::PreferenceRecord> {
        self.table()
    }

    pub fn settings(&self) -> Table<'_, noteum_core::SettingRecord> {
        self.table()
    }

    pub fn cache(&self) -> Table<'_, noteum_core::CacheRecord> {
        self.table()
    }

    pub fn metadata(&self) -> Table<'_, MetaRecord> {
        self.table()
    }

    /// Start a multi-table transaction.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            store: self,
            batch: WriteBatch::new(),
            events: Vec::new(),
        }
    }

    /// Run an index-checked query against a table.
    pub async fn query_raw(
        &self,
        table: TableName,
        query: &Query,
    ) -> NoteumResult<Vec<(String, Document)>> {
        self.ensure_open()?;
        self.schema.check_indexed(table, &query.field)?;
        self.store.query(table, query).await
    }

    // ========================================================================
    // SCHEMA VERSION
    // ========================================================================

    /// Stored schema version; 0 when never migrated.
    pub async fn schema_version(&self) -> NoteumResult<u32> {
        let record = self.metadata().get(SCHEMA_VERSION_KEY).await?;
        Ok(record.map(|r| version_of(&r)).unwrap_or(0))
    }

    pub async fn set_schema_version(&self, version: u32) -> NoteumResult<()> {
        self.metadata().put(schema_version_record(version)).await?;
        tracing::debug!(version, "Schema version updated");
        Ok(())
    }

    // ========================================================================
    // SNAPSHOTS
    // ========================================================================

    /// Raw contents of every declared table.
    pub async fn snapshot(&self) -> NoteumResult<TableSnapshot> {
        self.ensure_open()?;
        let mut snapshot = BTreeMap::new();
        for table in &self.schema.tables {
            snapshot.insert(table.name, self.store.scan(table.name).await?);
        }
        Ok(snapshot)
    }

    /// Replace every table with `snapshot` and set the schema version, in a
    /// single transaction.
    pub async fn restore_snapshot(&self, snapshot: &TableSnapshot, version: u32) -> NoteumResult<usize> {
        self.ensure_open()?;
        let mut batch = WriteBatch::new();
        for table in &self.schema.tables {
            batch.clear(table.name);
        }
        let mut restored = 0;
        for (table, rows) in snapshot {
            for (key, doc) in rows {
                batch.put(*table, key.clone(), doc.clone());
                restored += 1;
            }
        }
        batch.put(
            TableName::Metadata,
            SCHEMA_VERSION_KEY,
            encode(&schema_version_record(version))?,
        );
        self.store.commit(batch).await?;

        for table in &self.schema.tables {
            self.emit(
                table.name,
                ChangeEvent::cleared(table.name.as_str(), RECORD_STORE_SOURCE),
            );
        }
        tracing::info!(records = restored, version, "Snapshot restored");
        Ok(restored)
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    /// Per-table counts and sampled size estimates.
    pub async fn stats(&self) -> NoteumResult<StoreStats> {
        self.ensure_open()?;
        let mut tables = BTreeMap::new();
        let mut total_records = 0;
        let mut total_bytes = 0;

        for table in &self.schema.tables {
            let count = self.store.count(table.name).await?;
            let sample = self.store.sample(table.name, STATS_SAMPLE_SIZE).await?;
            let estimated_bytes = if sample.is_empty() {
                0
            } else {
                let sampled: u64 = sample.iter().map(doc_size).sum();
                (sampled / sample.len() as u64) * count as u64
            };
            total_records += count;
            total_bytes += estimated_bytes;
            tables.insert(
                table.name,
                TableStats {
                    count,
                    estimated_bytes,
                },
            );
        }

        let last_cleanup = self.state.read().ok().and_then(|s| s.last_cleanup);
        Ok(StoreStats {
            db_name: self.schema.name.clone(),
            backend: self.store.backend(),
            schema_version: self.schema_version().await?,
            tables,
            total_records,
            total_bytes,
            last_cleanup,
        })
    }

    // ========================================================================
    // CLEANUP
    // ========================================================================

    /// Remove expired tokens and expired or stale cache records.
    ///
    /// With `dry_run` the candidate set is computed and nothing is deleted.
    pub async fn cleanup(&self, options: CleanupOptions) -> NoteumResult<CleanupResult> {
        let started = Instant::now();
        let now = noteum_core::now();
        let now_ms = now.timestamp_millis();

        let mut candidates: BTreeMap<TableName, BTreeMap<String, Document>> = BTreeMap::new();

        if options.tables.contains(&TableName::Tokens) {
            let expired = self
                .query_raw(TableName::Tokens, &Query::below("expiresAt", now_ms))
                .await?;
            candidates
                .entry(TableName::Tokens)
                .or_default()
                .extend(expired);
        }

        if options.tables.contains(&TableName::Cache) {
            let max_age = options.max_age_hours.unwrap_or(self.config.max_age_hours);
            let stale_before = (now - ChronoDuration::hours(max_age as i64)).timestamp_millis();
            let expired = self
                .query_raw(TableName::Cache, &Query::below("expiresAt", now_ms))
                .await?;
            let stale = self
                .query_raw(TableName::Cache, &Query::below("updatedAt", stale_before))
                .await?;
            let entry = candidates.entry(TableName::Cache).or_default();
            entry.extend(expired);
            entry.extend(stale);
        }

        let mut breakdown = BTreeMap::new();
        let mut keys = BTreeMap::new();
        let mut space_freed = 0;
        let mut batch = WriteBatch::new();
        for (table, rows) in &candidates {
            breakdown.insert(*table, rows.len());
            keys.insert(*table, rows.keys().cloned().collect::<Vec<_>>());
            for (key, doc) in rows {
                space_freed += doc_size(doc);
                batch.delete(*table, key.clone());
            }
        }
        let records_removed = batch.len();

        if !options.dry_run && !batch.is_empty() {
            if let Err(e) = self.store.commit(batch).await {
                tracing::warn!(error = %e, "Cleanup failed");
                return Err(e);
            }
            for (table, rows) in candidates {
                for (key, doc) in rows {
                    let old = decode_value(&doc);
                    self.emit(table, ChangeEvent::removed(key, old, RECORD_STORE_SOURCE));
                }
            }
        }

        if !options.dry_run {
            if let Ok(mut state) = self.state.write() {
                state.last_cleanup = Some(now);
            }
        }

        let result = CleanupResult {
            dry_run: options.dry_run,
            records_removed,
            breakdown,
            keys,
            space_freed,
            duration: started.elapsed(),
        };
        tracing::info!(
            dry_run = result.dry_run,
            removed = result.records_removed,
            space_freed = result.space_freed,
            duration_ms = result.duration.as_millis() as u64,
            "Cleanup finished"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("db", &self.schema.name)
            .field("backend", &self.store.backend())
            .field("initialized", &self.is_initialized())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// TYPED TABLES
// ============================================================================

/// Typed accessor for one table.
pub struct Table<'a, R: Record> {
    store: &'a RecordStore,
    _marker: PhantomData<R>,
}

impl<'a, R: Record> Table<'a, R> {
    pub fn name(&self) -> TableName {
        R::TABLE
    }

    pub async fn get(&self, key: &str) -> NoteumResult<Option<R>> {
        self.store.ensure_open()?;
        match self.store.store.get(R::TABLE, key).await? {
            Some(doc) => Ok(Some(decode(doc)?)),
            None => Ok(None),
        }
    }

    /// Stamp and store a record; returns the stored version.
    pub async fn put(&self, mut record: R) -> NoteumResult<R> {
        self.store.ensure_open()?;
        let existing = self.get(record.key()).await?;
        record.stamp(noteum_core::now(), existing.as_ref());
        self.store
            .store
            .put(R::TABLE, record.key(), encode(&record)?)
            .await?;
        self.store.emit(
            R::TABLE,
            ChangeEvent::upsert(
                record.key(),
                existing.map(|e| e.value().clone()),
                record.value().clone(),
                RECORD_STORE_SOURCE,
            ),
        );
        Ok(record)
    }

    /// Delete a key. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> NoteumResult<bool> {
        self.store.ensure_open()?;
        let existing = self.get(key).await?;
        let deleted = self.store.store.delete(R::TABLE, key).await?;
        if deleted {
            self.store.emit(
                R::TABLE,
                ChangeEvent::removed(key, existing.map(|e| e.value().clone()), RECORD_STORE_SOURCE),
            );
        }
        Ok(deleted)
    }

    /// Stamp and store many records in one transaction.
    pub async fn bulk_put(&self, records: Vec<R>) -> NoteumResult<Vec<R>> {
        let mut tx = self.store.transaction();
        let mut stored = Vec::with_capacity(records.len());
        for record in records {
            stored.push(tx.put(record).await?);
        }
        tx.commit().await?;
        Ok(stored)
    }

    /// Delete many keys in one transaction. Returns how many existed.
    pub async fn bulk_delete(&self, keys: &[String]) -> NoteumResult<usize> {
        let mut tx = self.store.transaction();
        let mut existed = 0;
        for key in keys {
            if tx.delete::<R>(key).await? {
                existed += 1;
            }
        }
        tx.commit().await?;
        Ok(existed)
    }

    /// Records whose indexed `field` is strictly below `bound`.
    pub async fn below(&self, field: &str, bound: impl Into<Value>) -> NoteumResult<Vec<R>> {
        let rows = self
            .store
            .query_raw(R::TABLE, &Query::below(field, bound))
            .await?;
        rows.into_iter().map(|(_, doc)| decode(doc)).collect()
    }

    /// Records whose indexed `field` equals `value`.
    pub async fn equals(&self, field: &str, value: impl Into<Value>) -> NoteumResult<Vec<R>> {
        let rows = self
            .store
            .query_raw(R::TABLE, &Query::equals(field, value))
            .await?;
        rows.into_iter().map(|(_, doc)| decode(doc)).collect()
    }

    pub async fn all(&self) -> NoteumResult<Vec<R>> {
        self.store.ensure_open()?;
        let rows = self.store.store.scan(R::TABLE).await?;
        rows.into_iter().map(|(_, doc)| decode(doc)).collect()
    }

    pub async fn keys(&self) -> NoteumResult<Vec<String>> {
        self.store.ensure_open()?;
        let rows = self.store.store.scan(R::TABLE).await?;
        Ok(rows.into_iter().map(|(k, _)| k).collect())
    }

    pub async fn count(&self) -> NoteumResult<usize> {
        self.store.ensure_open()?;
        self.store.store.count(R::TABLE).await
    }

    /// Remove every record. Returns how many there were.
    pub async fn clear(&self) -> NoteumResult<usize> {
        let count = self.count().await?;
        let mut batch = WriteBatch::new();
        batch.clear(R::TABLE);
        self.store.store.commit(batch).await?;
        self.store.emit(
            R::TABLE,
            ChangeEvent::cleared(R::TABLE.as_str(), RECORD_STORE_SOURCE),
        );
        Ok(count)
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// Multi-table write transaction. Nothing is visible until
/// [`Transaction::commit`]; dropping it discards the writes.
pub struct Transaction<'a> {
    store: &'a RecordStore,
    batch: WriteBatch,
    events: Vec<(TableName, ChangeEvent)>,
}

impl<'a> Transaction<'a> {
    /// Stage a stamped put. Hooks see the currently committed record.
    pub async fn put<R: Record>(&mut self, mut record: R) -> NoteumResult<R> {
        let existing = self.store.table::<R>().get(record.key()).await?;
        record.stamp(noteum_core::now(), existing.as_ref());
        self.batch.put(R::TABLE, record.key(), encode(&record)?);
        self.events.push((
            R::TABLE,
            ChangeEvent::upsert(
                record.key(),
                existing.map(|e| e.value().clone()),
                record.value().clone(),
                RECORD_STORE_SOURCE,
            ),
        ));
        Ok(record)
    }

    /// Stage a delete. Returns whether the key currently exists.
    pub async fn delete<R: Record>(&mut self, key: &str) -> NoteumResult<bool> {
        let existing = self.store.table::<R>().get(key).await?;
        self.batch.delete(R::TABLE, key);
        let exists = existing.is_some();
        if let Some(old) = existing {
            self.events.push((
                R::TABLE,
                ChangeEvent::removed(key, Some(old.value().clone()), RECORD_STORE_SOURCE),
            ));
        }
        Ok(exists)
    }

    pub fn clear(&mut self, table: TableName) {
        self.batch.clear(table);
        self.events.push((
            table,
            ChangeEvent::cleared(table.as_str(), RECORD_STORE_SOURCE),
        ));
    }

    /// Stage a schema version update.
    pub fn set_schema_version(&mut self, version: u32) -> NoteumResult<()> {
        self.batch.put(
            TableName::Metadata,
            SCHEMA_VERSION_KEY,
            encode(&schema_version_record(version))?,
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Apply every staged write atomically. Returns the number of operations.
    pub async fn commit(self) -> NoteumResult<usize> {
        self.store.ensure_open()?;
        let ops = self.batch.len();
        if ops == 0 {
            return Ok(0);
        }
        self.store.store.commit(self.batch).await?;
        for (table, event) in self.events {
            self.store.emit(table, event);
        }
        Ok(ops)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn encode<R: Record>(record: &R) -> NoteumResult<Document> {
    serde_json::to_value(record).map_err(|e| {
        StorageError::Serialization {
            table: R::TABLE.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn decode<R: Record>(doc: Document) -> NoteumResult<R> {
    serde_json::from_value(doc).map_err(|e| {
        StorageError::Serialization {
            table: R::TABLE.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// The `value` field of a raw document, if it decodes.
fn decode_value(doc: &Document) -> Option<RecordValue> {
    doc.get("value")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Serialized size of a document in bytes.
pub fn doc_size(doc: &Document) -> u64 {
    serde_json::to_vec(doc).map(|v| v.len() as u64).unwrap_or(0)
}

fn schema_version_record(version: u32) -> MetaRecord {
    MetaRecord::system(SCHEMA_VERSION_KEY, RecordValue::Number(version as f64))
        .with_version(version)
        .readonly()
}

fn version_of(record: &MetaRecord) -> u32 {
    record.version.unwrap_or(match record.value {
        RecordValue::Number(n) if n >= 0.0 => n as u32,
        _ => 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use noteum_core::{CacheRecord, PreferenceRecord, SettingRecord, TokenRecord, TokenType};
    use noteum_events::{ChangeObserver, ChangeType, SubscriptionOptions};
    use std::sync::Mutex;

    fn test_store() -> RecordStore {
        let config = StoreConfig::default().with_auto_cleanup(false);
        RecordStore::new(Arc::new(MemoryObjectStore::new()), config)
    }

    async fn initialized_store() -> RecordStore {
        let store = test_store();
        store.initialize().await.expect("initialize should succeed");
        store
    }

    #[tokio::test]
    async fn test_initialize_verifies_schema() {
        let store = RecordStore::new(
            Arc::new(MemoryObjectStore::with_tables(&[TableName::Tokens, TableName::Metadata])),
            StoreConfig::default().with_auto_cleanup(false),
        );
        let err = store.initialize().await.expect_err("initialize should fail");
        match err {
            NoteumError::Storage(StorageError::SchemaVerification { missing }) => {
                assert_eq!(missing, vec!["preferences", "settings", "cache"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!store.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_writes_marker() {
        let store = initialized_store().await;
        let marker = store
            .metadata()
            .get(DB_INITIALIZED_KEY)
            .await
            .expect("get should succeed");
        assert!(marker.is_some());
        store.initialize().await.expect("second initialize should succeed");
    }

    #[tokio::test]
    async fn test_put_stamps_timestamps() {
        let store = initialized_store().await;
        let mut record = PreferenceRecord::new("theme", "dark", "ui");
        record.created_at = noteum_core::now() + ChronoDuration::days(30);

        let stored = store.preferences().put(record).await.expect("put should succeed");
        assert!(stored.created_at <= noteum_core::now());
        assert!(stored.updated_at >= stored.created_at);

        let updated = store
            .preferences()
            .put(PreferenceRecord::new("theme", "light", "ui"))
            .await
            .expect("put should succeed");
        assert_eq!(updated.created_at, stored.created_at);

        let fetched = store
            .preferences()
            .get("theme")
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(fetched, updated);
    }

    #[tokio::test]
    async fn test_range_queries_require_index() {
        let store = initialized_store().await;
        store
            .tokens()
            .put(TokenRecord::new("u1:access", "t").with_owner("u1").with_type(TokenType::Access))
            .await
            .expect("put should succeed");
        store
            .tokens()
            .put(TokenRecord::new("u2:access", "t").with_owner("u2"))
            .await
            .expect("put should succeed");

        let owned = store
            .tokens()
            .equals("ownerId", "u1")
            .await
            .expect("query should succeed");
        assert_eq!(owned.len(), 1);

        let err = store
            .settings()
            .equals("ownerId", "u1")
            .await
            .expect_err("query should fail");
        assert!(matches!(err, NoteumError::Storage(StorageError::NotIndexed { .. })));
    }

    #[tokio::test]
    async fn test_cleanup_dry_run_then_real() {
        let store = initialized_store().await;
        let past = noteum_core::now() - ChronoDuration::hours(1);
        let future = noteum_core::now() + ChronoDuration::hours(1);

        store
            .tokens()
            .bulk_put(vec![
                TokenRecord::new("expired", "t").with_expires_at(past),
                TokenRecord::new("live", "t").with_expires_at(future),
                TokenRecord::new("forever", "t"),
            ])
            .await
            .expect("bulk_put should succeed");
        store
            .cache()
            .put(CacheRecord::new("old", "v").with_expires_at(past))
            .await
            .expect("put should succeed");
        store
            .cache()
            .put(CacheRecord::new("fresh", "v"))
            .await
            .expect("put should succeed");

        let preview = store
            .cleanup(CleanupOptions::dry_run())
            .await
            .expect("cleanup should succeed");
        assert!(preview.dry_run);
        assert_eq!(preview.records_removed, 2);
        assert_eq!(preview.breakdown.get(&TableName::Tokens), Some(&1));
        assert_eq!(store.tokens().count().await.expect("count should succeed"), 3);

        let result = store
            .cleanup(CleanupOptions::default())
            .await
            .expect("cleanup should succeed");
        assert_eq!(result.records_removed, 2);
        assert!(result.space_freed > 0);
        assert_eq!(store.tokens().count().await.expect("count should succeed"), 2);
        assert_eq!(
            store.cache().keys().await.expect("keys should succeed"),
            vec!["fresh".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_stale_cache() {
        let store = initialized_store().await;
        store
            .cache()
            .put(CacheRecord::new("k", "v"))
            .await
            .expect("put should succeed");

        // Zero max age makes every record older than "now".
        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = store
            .cleanup(CleanupOptions::default().with_max_age_hours(0))
            .await
            .expect("cleanup should succeed");
        assert_eq!(result.breakdown.get(&TableName::Cache), Some(&1));
    }

    #[tokio::test]
    async fn test_stats_sample_sizes() {
        let store = initialized_store().await;
        for i in 0..25 {
            store
                .settings()
                .put(SettingRecord::new(format!("s{i}"), "value", "app"))
                .await
                .expect("put should succeed");
        }
        store.set_schema_version(1).await.expect("set version should succeed");

        let stats = store.stats().await.expect("stats should succeed");
        let settings = stats.tables.get(&TableName::Settings).expect("settings stats");
        assert_eq!(settings.count, 25);
        assert!(settings.estimated_bytes > 0);
        assert_eq!(stats.schema_version, 1);
        // marker + schema version
        assert_eq!(stats.tables.get(&TableName::Metadata).map(|t| t.count), Some(2));
    }

    #[tokio::test]
    async fn test_transaction_is_atomic() {
        let store = initialized_store().await;
        let mut tx = store.transaction();
        tx.put(SettingRecord::new("a", "1", "app"))
            .await
            .expect("stage should succeed");
        tx.put(PreferenceRecord::new("b", "2", "ui"))
            .await
            .expect("stage should succeed");
        assert_eq!(store.settings().count().await.expect("count should succeed"), 0);

        assert_eq!(tx.commit().await.expect("commit should succeed"), 2);
        assert_eq!(store.settings().count().await.expect("count should succeed"), 1);
        assert_eq!(store.preferences().count().await.expect("count should succeed"), 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let store = initialized_store().await;
        store
            .settings()
            .put(SettingRecord::new("a", "1", "app"))
            .await
            .expect("put should succeed");
        store.set_schema_version(1).await.expect("set version should succeed");
        let snapshot = store.snapshot().await.expect("snapshot should succeed");

        store
            .settings()
            .put(SettingRecord::new("b", "2", "app"))
            .await
            .expect("put should succeed");
        store.set_schema_version(2).await.expect("set version should succeed");

        store
            .restore_snapshot(&snapshot, 1)
            .await
            .expect("restore should succeed");
        assert_eq!(store.settings().keys().await.expect("keys should succeed"), vec!["a"]);
        assert_eq!(store.schema_version().await.expect("version should succeed"), 1);
    }

    #[tokio::test]
    async fn test_mutations_emit_events() {
        let notifier = ChangeNotifier::new(
            noteum_core::EventConfig::default().with_debounce(Duration::ZERO),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: Arc<dyn ChangeObserver> =
            Arc::new(move |event: &ChangeEvent| -> Result<(), String> {
                sink.lock()
                    .map_err(|e| e.to_string())?
                    .push((event.key.clone(), event.change_type));
                Ok(())
            });
        notifier
            .subscribe(
                observer,
                SubscriptionOptions::new().with_source(RECORD_STORE_SOURCE),
            )
            .expect("subscribe should succeed");

        let store = test_store().with_notifier(notifier);
        store.initialize().await.expect("initialize should succeed");
        store
            .settings()
            .put(SettingRecord::new("a", "1", "app"))
            .await
            .expect("put should succeed");
        store
            .settings()
            .put(SettingRecord::new("a", "2", "app"))
            .await
            .expect("put should succeed");
        store.settings().delete("a").await.expect("delete should succeed");

        let seen = seen.lock().expect("lock should succeed");
        let settings_events: Vec<_> = seen.iter().filter(|(k, _)| k == "a").collect();
        assert_eq!(
            settings_events
                .iter()
                .map(|(_, t)| *t)
                .collect::<Vec<_>>(),
            vec![ChangeType::Added, ChangeType::Updated, ChangeType::Removed]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let store = initialized_store().await;
        store.close().await.expect("close should succeed");
        store.close().await.expect("second close should succeed");
        assert!(matches!(
            store.settings().count().await,
            Err(NoteumError::Storage(StorageError::Closed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_cleanup_runs_periodically() {
        let config = StoreConfig::default().with_cleanup_interval(Duration::from_secs(60));
        let store = RecordStore::new(Arc::new(MemoryObjectStore::new()), config);
        store.initialize().await.expect("initialize should succeed");
        store
            .tokens()
            .put(TokenRecord::new("gone", "t").with_expires_at(noteum_core::now() - ChronoDuration::hours(1)))
            .await
            .expect("put should succeed");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.tokens().count().await.expect("count should succeed"), 0);
        store.close().await.expect("close should succeed");
    }
}

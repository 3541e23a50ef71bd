//! LMDB-backed object store.
//!
//! Uses the heed crate (Rust bindings for LMDB). Each table is a named
//! database inside one environment, so a single write transaction spans every
//! table and [`ObjectStore::commit`] is atomic across tables.
//!
//! # Layout
//!
//! - Keys are UTF-8 record keys.
//! - Values are the JSON encoding of the record document.
//! - Reads use read transactions; every mutation commits its own write
//!   transaction.
//! - Transactions run on tokio's blocking pool against a cloned [`Env`], so
//!   commits and syncs never stall the async workers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use ::async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use noteum_core::{NoteumError, NoteumResult, StorageError, TableName};

use crate::object_store::{Document, ObjectStore, WriteBatch, WriteOp};

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database {table}: {reason}")]
    DbOpen { table: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbStoreError to NoteumError. Opening failures are fatal.
impl From<LmdbStoreError> for NoteumError {
    fn from(e: LmdbStoreError) -> Self {
        NoteumError::Storage(StorageError::Initialization {
            reason: e.to_string(),
        })
    }
}

/// LMDB-backed [`ObjectStore`].
///
/// # Example
///
/// ```ignore
/// use noteum_storage::LmdbObjectStore;
///
/// let store = LmdbObjectStore::open("/tmp/noteum", 100)?;
/// let tables = store.table_names().await?;
/// ```
pub struct LmdbObjectStore {
    /// The LMDB environment.
    env: Env,
    /// One named database per table.
    dbs: HashMap<TableName, Database<Str, Bytes>>,
    closed: AtomicBool,
}

impl LmdbObjectStore {
    /// Open (or create) a store with all five tables.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_mb` - Maximum size of the environment in megabytes
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, LmdbStoreError> {
        Self::open_with_tables(path, map_size_mb, &TableName::ALL)
    }

    /// Open a store creating only the given tables.
    pub fn open_with_tables<P: AsRef<Path>>(
        path: P,
        map_size_mb: usize,
        tables: &[TableName],
    ) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(TableName::ALL.len() as u32)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut dbs = HashMap::new();
        for table in tables {
            let db: Database<Str, Bytes> = env
                .create_database(&mut wtxn, Some(table.as_str()))
                .map_err(|e| LmdbStoreError::DbOpen {
                    table: table.to_string(),
                    reason: e.to_string(),
                })?;
            dbs.insert(*table, db);
        }

        wtxn.commit()
            .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        tracing::debug!(path = %path.as_ref().display(), tables = dbs.len(), "LMDB store opened");

        Ok(Self {
            env,
            dbs,
            closed: AtomicBool::new(false),
        })
    }

    fn db(&self, table: TableName) -> NoteumResult<Database<Str, Bytes>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed.into());
        }
        self.dbs
            .get(&table)
            .copied()
            .ok_or_else(|| StorageError::operation_failed(table.as_str(), "table not found").into())
    }

    /// Run LMDB work on the blocking pool.
    async fn blocking<T, F>(&self, label: &'static str, work: F) -> NoteumResult<T>
    where
        F: FnOnce(&Env) -> NoteumResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let env = self.env.clone();
        tokio::task::spawn_blocking(move || work(&env))
            .await
            .map_err(|e| StorageError::operation_failed(label, format!("blocking task failed: {e}")))?
    }

    fn txn_err(table: TableName, e: heed::Error) -> NoteumError {
        StorageError::operation_failed(table.as_str(), e.to_string()).into()
    }

    fn encode(table: TableName, doc: &Document) -> NoteumResult<Vec<u8>> {
        serde_json::to_vec(doc).map_err(|e| {
            StorageError::Serialization {
                table: table.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn decode(table: TableName, bytes: &[u8]) -> NoteumResult<Document> {
        serde_json::from_slice(bytes).map_err(|e| {
            StorageError::Serialization {
                table: table.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl ObjectStore for LmdbObjectStore {
    fn backend(&self) -> &'static str {
        "lmdb"
    }

    async fn table_names(&self) -> NoteumResult<Vec<String>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed.into());
        }
        let mut names: Vec<String> = self.dbs.keys().map(|t| t.as_str().to_string()).collect();
        names.sort();
        Ok(names)
    }

    async fn close(&self) -> NoteumResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn get(&self, table: TableName, key: &str) -> NoteumResult<Option<Document>> {
        let db = self.db(table)?;
        let key = key.to_string();
        self.blocking(table.as_str(), move |env| {
            let rtxn = env.read_txn().map_err(|e| Self::txn_err(table, e))?;
            match db.get(&rtxn, &key).map_err(|e| Self::txn_err(table, e))? {
                Some(bytes) => Ok(Some(Self::decode(table, bytes)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, table: TableName, key: &str, doc: Document) -> NoteumResult<()> {
        let db = self.db(table)?;
        let bytes = Self::encode(table, &doc)?;
        let key = key.to_string();
        self.blocking(table.as_str(), move |env| {
            let mut wtxn = env.write_txn().map_err(|e| Self::txn_err(table, e))?;
            db.put(&mut wtxn, &key, &bytes)
                .map_err(|e| Self::txn_err(table, e))?;
            wtxn.commit().map_err(|e| Self::txn_err(table, e))
        })
        .await
    }

    async fn delete(&self, table: TableName, key: &str) -> NoteumResult<bool> {
        let db = self.db(table)?;
        let key = key.to_string();
        self.blocking(table.as_str(), move |env| {
            let mut wtxn = env.write_txn().map_err(|e| Self::txn_err(table, e))?;
            let deleted = db
                .delete(&mut wtxn, &key)
                .map_err(|e| Self::txn_err(table, e))?;
            wtxn.commit().map_err(|e| Self::txn_err(table, e))?;
            Ok(deleted)
        })
        .await
    }

    async fn scan(&self, table: TableName) -> NoteumResult<Vec<(String, Document)>> {
        let db = self.db(table)?;
        self.blocking(table.as_str(), move |env| {
            let rtxn = env.read_txn().map_err(|e| Self::txn_err(table, e))?;
            let iter = db.iter(&rtxn).map_err(|e| Self::txn_err(table, e))?;

            let mut rows = Vec::new();
            for result in iter {
                let (key, bytes) = result.map_err(|e| Self::txn_err(table, e))?;
                rows.push((key.to_string(), Self::decode(table, bytes)?));
            }
            Ok(rows)
        })
        .await
    }

    async fn count(&self, table: TableName) -> NoteumResult<usize> {
        let db = self.db(table)?;
        self.blocking(table.as_str(), move |env| {
            let rtxn = env.read_txn().map_err(|e| Self::txn_err(table, e))?;
            let len = db.len(&rtxn).map_err(|e| Self::txn_err(table, e))?;
            Ok(len as usize)
        })
        .await
    }

    async fn commit(&self, batch: WriteBatch) -> NoteumResult<()> {
        // Resolve and encode up front so an unknown table aborts before any
        // transaction opens.
        let mut staged = Vec::with_capacity(batch.len());
        for op in batch.into_ops() {
            let table = op.table();
            let db = self.db(table)?;
            let op = match op {
                WriteOp::Put { key, doc, .. } => Staged::Put(key, Self::encode(table, &doc)?),
                WriteOp::Delete { key, .. } => Staged::Delete(key),
                WriteOp::Clear { .. } => Staged::Clear,
            };
            staged.push((table, db, op));
        }

        self.blocking("batch", move |env| {
            let mut wtxn = env
                .write_txn()
                .map_err(|e| StorageError::operation_failed("batch", e.to_string()))?;

            // Dropping `wtxn` on any error aborts the whole transaction.
            for (table, db, op) in staged {
                match op {
                    Staged::Put(key, bytes) => {
                        db.put(&mut wtxn, &key, &bytes)
                            .map_err(|e| Self::txn_err(table, e))?;
                    }
                    Staged::Delete(key) => {
                        db.delete(&mut wtxn, &key)
                            .map_err(|e| Self::txn_err(table, e))?;
                    }
                    Staged::Clear => {
                        db.clear(&mut wtxn).map_err(|e| Self::txn_err(table, e))?;
                    }
                }
            }

            wtxn.commit()
                .map_err(|e| StorageError::operation_failed("batch", e.to_string()))?;
            Ok(())
        })
        .await
    }
}

/// A batch operation with its document already encoded.
enum Staged {
    Put(String, Vec<u8>),
    Delete(String),
    Clear,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbObjectStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbObjectStore::open(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_open_creates_all_tables() {
        let (store, _dir) = create_test_store();
        let names = store.table_names().await.expect("table_names should succeed");
        assert_eq!(names.len(), 5);
        assert!(names.contains(&"metadata".to_string()));
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _dir) = create_test_store();
        let doc = json!({ "key": "theme", "value": { "kind": "text", "data": "dark" } });
        store
            .put(TableName::Preferences, "theme", doc.clone())
            .await
            .expect("put should succeed");

        let fetched = store
            .get(TableName::Preferences, "theme")
            .await
            .expect("get should succeed");
        assert_eq!(fetched, Some(doc));
        assert_eq!(
            store.get(TableName::Settings, "theme").await.expect("get should succeed"),
            None
        );
    }

    #[tokio::test]
    async fn test_commit_spans_tables() {
        let (store, _dir) = create_test_store();
        store
            .put(TableName::Cache, "stale", json!({}))
            .await
            .expect("put should succeed");

        let mut batch = WriteBatch::new();
        batch
            .put(TableName::Tokens, "t1", json!({ "key": "t1" }))
            .clear(TableName::Cache)
            .put(TableName::Metadata, "schema_version", json!({ "version": 2 }));
        store.commit(batch).await.expect("commit should succeed");

        assert_eq!(store.count(TableName::Tokens).await.expect("count should succeed"), 1);
        assert_eq!(store.count(TableName::Cache).await.expect("count should succeed"), 0);
        assert_eq!(store.count(TableName::Metadata).await.expect("count should succeed"), 1);
    }

    #[tokio::test]
    async fn test_commit_to_missing_table_writes_nothing() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbObjectStore::open_with_tables(temp_dir.path(), 10, &[TableName::Tokens])
            .expect("store creation should succeed");

        let mut batch = WriteBatch::new();
        batch
            .put(TableName::Tokens, "t1", json!({}))
            .put(TableName::Settings, "s1", json!({}));
        assert!(store.commit(batch).await.is_err());
        assert_eq!(store.count(TableName::Tokens).await.expect("count should succeed"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_on_blocking_pool() {
        let (store, _dir) = create_test_store();
        let store = std::sync::Arc::new(store);

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    let mut batch = WriteBatch::new();
                    for j in 0..25 {
                        batch.put(TableName::Cache, format!("w{i}_{j}"), json!({ "n": j }));
                    }
                    store.commit(batch).await
                })
            })
            .collect();
        for writer in writers {
            writer
                .await
                .expect("writer task should join")
                .expect("commit should succeed");
        }

        assert_eq!(store.count(TableName::Cache).await.expect("count should succeed"), 200);
        assert_eq!(
            store.get(TableName::Cache, "w7_24").await.expect("get should succeed"),
            Some(json!({ "n": 24 }))
        );
    }

    #[tokio::test]
    async fn test_query_uses_default_scan() {
        let (store, _dir) = create_test_store();
        for (key, expires) in [("a", 10), ("b", 20), ("c", 30)] {
            store
                .put(TableName::Tokens, key, json!({ "expiresAt": expires }))
                .await
                .expect("put should succeed");
        }
        let hits = store
            .query(TableName::Tokens, &crate::Query::below("expiresAt", 25))
            .await
            .expect("query should succeed");
        assert_eq!(hits.len(), 2);
    }
}

//! In-memory object store.
//!
//! Tables are `BTreeMap`s behind one `RwLock`, so a batch commit holding the
//! write lock is atomic with respect to every reader. Suitable for tests and
//! ephemeral sessions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use ::async_trait::async_trait;
use noteum_core::{NoteumResult, StorageError, TableName};

use crate::object_store::{Document, ObjectStore, WriteBatch, WriteOp};

type Tables = HashMap<String, BTreeMap<String, Document>>;

/// In-memory [`ObjectStore`] implementation.
pub struct MemoryObjectStore {
    tables: RwLock<Tables>,
    closed: AtomicBool,
}

impl MemoryObjectStore {
    /// Create a store with all five tables.
    pub fn new() -> Self {
        Self::with_tables(&TableName::ALL)
    }

    /// Create a store holding only the given tables.
    pub fn with_tables(tables: &[TableName]) -> Self {
        let tables = tables
            .iter()
            .map(|t| (t.as_str().to_string(), BTreeMap::new()))
            .collect();
        Self {
            tables: RwLock::new(tables),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> NoteumResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed.into());
        }
        Ok(())
    }

    fn missing(table: TableName) -> StorageError {
        StorageError::operation_failed(table.as_str(), "table not found")
    }

    fn read<R>(&self, table: TableName, f: impl FnOnce(&BTreeMap<String, Document>) -> R) -> NoteumResult<R> {
        self.ensure_open()?;
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let rows = tables.get(table.as_str()).ok_or_else(|| Self::missing(table))?;
        Ok(f(rows))
    }

    fn write<R>(
        &self,
        table: TableName,
        f: impl FnOnce(&mut BTreeMap<String, Document>) -> R,
    ) -> NoteumResult<R> {
        self.ensure_open()?;
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let rows = tables
            .get_mut(table.as_str())
            .ok_or_else(|| Self::missing(table))?;
        Ok(f(rows))
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn table_names(&self) -> NoteumResult<Vec<String>> {
        self.ensure_open()?;
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn close(&self) -> NoteumResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn get(&self, table: TableName, key: &str) -> NoteumResult<Option<Document>> {
        self.read(table, |rows| rows.get(key).cloned())
    }

    async fn put(&self, table: TableName, key: &str, doc: Document) -> NoteumResult<()> {
        self.write(table, |rows| {
            rows.insert(key.to_string(), doc);
        })
    }

    async fn delete(&self, table: TableName, key: &str) -> NoteumResult<bool> {
        self.write(table, |rows| rows.remove(key).is_some())
    }

    async fn scan(&self, table: TableName) -> NoteumResult<Vec<(String, Document)>> {
        self.read(table, |rows| {
            rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        })
    }

    async fn count(&self, table: TableName) -> NoteumResult<usize> {
        self.read(table, |rows| rows.len())
    }

    async fn commit(&self, batch: WriteBatch) -> NoteumResult<()> {
        self.ensure_open()?;
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;

        // Validate first so that a bad op leaves every table untouched.
        for table in batch.tables() {
            if !tables.contains_key(table.as_str()) {
                return Err(Self::missing(table).into());
            }
        }

        for op in batch.into_ops() {
            let table = op.table();
            let Some(rows) = tables.get_mut(table.as_str()) else {
                return Err(Self::missing(table).into());
            };
            match op {
                WriteOp::Put { key, doc, .. } => {
                    rows.insert(key, doc);
                }
                WriteOp::Delete { key, .. } => {
                    rows.remove(&key);
                }
                WriteOp::Clear { .. } => rows.clear(),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noteum_core::NoteumError;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryObjectStore::new();
        store
            .put(TableName::Settings, "lang", json!({ "key": "lang" }))
            .await
            .expect("put should succeed");

        let doc = store
            .get(TableName::Settings, "lang")
            .await
            .expect("get should succeed");
        assert_eq!(doc, Some(json!({ "key": "lang" })));

        assert!(store.delete(TableName::Settings, "lang").await.expect("delete should succeed"));
        assert!(!store.delete(TableName::Settings, "lang").await.expect("delete should succeed"));
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let store = MemoryObjectStore::with_tables(&[TableName::Tokens]);
        let mut batch = WriteBatch::new();
        batch
            .put(TableName::Tokens, "a", json!({}))
            .put(TableName::Cache, "b", json!({}));

        let result = store.commit(batch).await;
        assert!(matches!(
            result,
            Err(NoteumError::Storage(StorageError::OperationFailed { .. }))
        ));
        assert_eq!(store.count(TableName::Tokens).await.expect("count should succeed"), 0);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = MemoryObjectStore::new();
        store.close().await.expect("close should succeed");
        assert_eq!(
            store.count(TableName::Tokens).await,
            Err(NoteumError::Storage(StorageError::Closed))
        );
    }

    #[tokio::test]
    async fn test_scan_is_key_ordered() {
        let store = MemoryObjectStore::new();
        for key in ["c", "a", "b"] {
            store
                .put(TableName::Cache, key, json!({ "key": key }))
                .await
                .expect("put should succeed");
        }
        let keys: Vec<String> = store
            .scan(TableName::Cache)
            .await
            .expect("scan should succeed")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}

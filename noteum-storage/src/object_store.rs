//! Underlying persistent object store contract.
//!
//! The Record Store depends only on this trait. A store exposes named
//! tables of JSON documents keyed by string, predicate queries over document
//! fields, and an atomic multi-table [`WriteBatch`].

use std::cmp::Ordering;

use ::async_trait::async_trait;
use noteum_core::{NoteumResult, TableName};
use serde_json::Value;

/// A stored document.
pub type Document = Value;

/// Field predicate for range queries.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field is strictly below the bound.
    Below(Value),
    /// Field equals the value.
    Equals(Value),
}

/// `where(field).below/equals(...)` query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub field: String,
    pub predicate: Predicate,
}

impl Query {
    pub fn below(field: impl Into<String>, bound: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            predicate: Predicate::Below(bound.into()),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            predicate: Predicate::Equals(value.into()),
        }
    }

    /// Evaluate against a document. Missing or incomparable fields never match.
    pub fn matches(&self, doc: &Document) -> bool {
        let Some(field) = doc.get(&self.field) else {
            return false;
        };
        match &self.predicate {
            Predicate::Below(bound) => compare(field, bound) == Some(Ordering::Less),
            Predicate::Equals(expected) => match compare(field, expected) {
                Some(ordering) => ordering == Ordering::Equal,
                None => field == expected,
            },
        }
    }
}

/// Order two scalar JSON values of the same kind.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// One operation in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        table: TableName,
        key: String,
        doc: Document,
    },
    Delete {
        table: TableName,
        key: String,
    },
    Clear {
        table: TableName,
    },
}

impl WriteOp {
    pub fn table(&self) -> TableName {
        match self {
            WriteOp::Put { table, .. } | WriteOp::Delete { table, .. } | WriteOp::Clear { table } => {
                *table
            }
        }
    }
}

/// Ordered operations applied all-or-nothing across tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: TableName, key: impl Into<String>, doc: Document) -> &mut Self {
        self.ops.push(WriteOp::Put {
            table,
            key: key.into(),
            doc,
        });
        self
    }

    pub fn delete(&mut self, table: TableName, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            table,
            key: key.into(),
        });
        self
    }

    pub fn clear(&mut self, table: TableName) -> &mut Self {
        self.ops.push(WriteOp::Clear { table });
        self
    }

    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Distinct tables touched by the batch, in first-use order.
    pub fn tables(&self) -> Vec<TableName> {
        let mut tables = Vec::new();
        for op in &self.ops {
            if !tables.contains(&op.table()) {
                tables.push(op.table());
            }
        }
        tables
    }
}

/// Async contract of the underlying persistent object store.
///
/// Implementations must apply [`ObjectStore::commit`] atomically: either
/// every operation of the batch becomes visible or none does. Single-key
/// calls on the same table resolve in commit order.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    // ========================================================================
    // STORE
    // ========================================================================

    /// Human-readable backend name, used in logs.
    fn backend(&self) -> &'static str;

    /// Names of the tables that exist in the store.
    async fn table_names(&self) -> NoteumResult<Vec<String>>;

    /// Release resources. Later calls fail with `StorageError::Closed`.
    async fn close(&self) -> NoteumResult<()>;

    // ========================================================================
    // SINGLE-KEY OPERATIONS
    // ========================================================================

    async fn get(&self, table: TableName, key: &str) -> NoteumResult<Option<Document>>;

    async fn put(&self, table: TableName, key: &str, doc: Document) -> NoteumResult<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, table: TableName, key: &str) -> NoteumResult<bool>;

    // ========================================================================
    // SCANS
    // ========================================================================

    /// Every `(key, document)` of a table in key order.
    async fn scan(&self, table: TableName) -> NoteumResult<Vec<(String, Document)>>;

    async fn count(&self, table: TableName) -> NoteumResult<usize>;

    /// Documents matching a field predicate.
    async fn query(&self, table: TableName, query: &Query) -> NoteumResult<Vec<(String, Document)>> {
        Ok(self
            .scan(table)
            .await?
            .into_iter()
            .filter(|(_, doc)| query.matches(doc))
            .collect())
    }

    /// Up to `limit` documents, used for size estimation.
    async fn sample(&self, table: TableName, limit: usize) -> NoteumResult<Vec<Document>> {
        Ok(self
            .scan(table)
            .await?
            .into_iter()
            .take(limit)
            .map(|(_, doc)| doc)
            .collect())
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    /// Apply a batch atomically across all tables it touches.
    async fn commit(&self, batch: WriteBatch) -> NoteumResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_below_compares_numbers() {
        let doc = json!({ "expiresAt": 100 });
        assert!(Query::below("expiresAt", 101).matches(&doc));
        assert!(!Query::below("expiresAt", 100).matches(&doc));
    }

    #[test]
    fn test_null_and_missing_fields_never_match_below() {
        assert!(!Query::below("expiresAt", 10).matches(&json!({ "expiresAt": null })));
        assert!(!Query::below("expiresAt", 10).matches(&json!({})));
    }

    #[test]
    fn test_equals_on_strings_and_bools() {
        let doc = json!({ "ownerId": "u1", "isGlobal": true });
        assert!(Query::equals("ownerId", "u1").matches(&doc));
        assert!(!Query::equals("ownerId", "u2").matches(&doc));
        assert!(Query::equals("isGlobal", true).matches(&doc));
    }

    #[test]
    fn test_batch_tables_are_distinct() {
        let mut batch = WriteBatch::new();
        batch
            .put(TableName::Tokens, "a", json!({}))
            .delete(TableName::Cache, "b")
            .clear(TableName::Tokens);
        assert_eq!(batch.tables(), vec![TableName::Tokens, TableName::Cache]);
        assert_eq!(batch.len(), 3);
    }
}

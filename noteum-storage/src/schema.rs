//! Declared database schema.
//!
//! Every table has the primary key `key` plus a fixed set of indexed fields.
//! Range queries are only accepted on indexed fields.

use noteum_core::constants::{DB_NAME, SCHEMA_VERSION};
use noteum_core::{NoteumResult, StorageError, TableName};

/// Schema of a single table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: TableName,
    pub primary_key: &'static str,
    pub indexes: &'static [&'static str],
}

impl TableSchema {
    pub fn is_indexed(&self, field: &str) -> bool {
        field == self.primary_key || self.indexes.contains(&field)
    }
}

const TOKENS: TableSchema = TableSchema {
    name: TableName::Tokens,
    primary_key: "key",
    indexes: &["expiresAt", "createdAt", "type", "ownerId"],
};

const PREFERENCES: TableSchema = TableSchema {
    name: TableName::Preferences,
    primary_key: "key",
    indexes: &["updatedAt", "ownerId", "category", "isGlobal"],
};

const SETTINGS: TableSchema = TableSchema {
    name: TableName::Settings,
    primary_key: "key",
    indexes: &["updatedAt", "scope", "requiresRestart"],
};

const CACHE: TableSchema = TableSchema {
    name: TableName::Cache,
    primary_key: "key",
    indexes: &["expiresAt", "updatedAt", "size", "hitCount", "source", "tags"],
};

const METADATA: TableSchema = TableSchema {
    name: TableName::Metadata,
    primary_key: "key",
    indexes: &["updatedAt", "kind", "version", "readonly"],
};

/// Whole-database schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub name: String,
    pub version: u32,
    pub tables: Vec<TableSchema>,
}

impl Schema {
    /// The Noteum schema at the version this build declares.
    pub fn noteum() -> Self {
        Self {
            name: DB_NAME.to_string(),
            version: SCHEMA_VERSION,
            tables: vec![TOKENS, PREFERENCES, SETTINGS, CACHE, METADATA],
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn table(&self, name: TableName) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Fail unless `field` is indexed on `table`.
    pub fn check_indexed(&self, table: TableName, field: &str) -> NoteumResult<()> {
        match self.table(table) {
            Some(schema) if schema.is_indexed(field) => Ok(()),
            _ => Err(StorageError::NotIndexed {
                table: table.to_string(),
                field: field.to_string(),
            }
            .into()),
        }
    }

    /// Required tables absent from `present`.
    pub fn missing_tables(&self, present: &[String]) -> Vec<String> {
        self.tables
            .iter()
            .map(|t| t.name.as_str())
            .filter(|name| !present.iter().any(|p| p == name))
            .map(str::to_string)
            .collect()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::noteum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_tables_declared() {
        let schema = Schema::noteum();
        for table in TableName::ALL {
            assert!(schema.table(table).is_some(), "{table} should be declared");
        }
    }

    #[test]
    fn test_index_check() {
        let schema = Schema::noteum();
        assert!(schema.check_indexed(TableName::Tokens, "expiresAt").is_ok());
        assert!(schema.check_indexed(TableName::Tokens, "key").is_ok());
        assert!(schema.check_indexed(TableName::Settings, "ownerId").is_err());
    }

    #[test]
    fn test_missing_tables() {
        let schema = Schema::noteum();
        let present = vec!["tokens".to_string(), "cache".to_string()];
        let missing = schema.missing_tables(&present);
        assert_eq!(missing, vec!["preferences", "settings", "metadata"]);
    }
}

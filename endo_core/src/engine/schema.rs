//! Typed schema declarations for the key-value engine.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A record key extracted from a table's key path
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Interpret a JSON value as a key; only integers and non-empty strings qualify
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n.as_i64().map(Key::Int),
            Value::String(s) if !s.is_empty() => Some(Key::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(n) => Value::from(*n),
            Key::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{}", n),
            Key::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Int(n)
    }
}

/// Declaration of one table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    /// Top-level record field holding the unique key
    pub key_path: String,
    /// Assign integer keys to records that arrive without one
    pub auto_increment: bool,
}

impl TableSchema {
    /// A table keyed uniquely by `key_path`
    pub fn keyed(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            auto_increment: false,
        }
    }

    /// A table whose integer keys are assigned on insert when missing
    pub fn auto_increment(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            auto_increment: true,
            ..Self::keyed(name, key_path)
        }
    }

    /// Extract the key of a record
    pub fn key_of(&self, record: &Value) -> Option<Key> {
        record.get(&self.key_path).and_then(Key::from_value)
    }
}

/// A versioned set of table declarations
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    pub version: u32,
    tables: Vec<TableSchema>,
}

impl Schema {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            tables: Vec::new(),
        }
    }

    /// Add a table declaration
    pub fn table(mut self, table: TableSchema) -> Self {
        self.tables.push(table);
        self
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    /// Look up a declared table
    pub fn get(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Reject schemas the engine cannot open
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(Error::Schema("schema version must be at least 1".into()));
        }
        if self.tables.is_empty() {
            return Err(Error::Schema("schema declares no tables".into()));
        }
        for (i, table) in self.tables.iter().enumerate() {
            if !is_valid_name(&table.name) {
                return Err(Error::Schema(format!("invalid table name '{}'", table.name)));
            }
            if table.key_path.is_empty() {
                return Err(Error::Schema(format!(
                    "table '{}' has an empty key path",
                    table.name
                )));
            }
            if self.tables[..i].iter().any(|t| t.name == table.name) {
                return Err(Error::Schema(format!("table '{}' declared twice", table.name)));
            }
        }
        Ok(())
    }
}

/// Table and database names double as file names on disk
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_extraction() {
        let table = TableSchema::keyed("entries", "date");
        assert_eq!(
            table.key_of(&json!({"date": "2024-01-01"})),
            Some(Key::from("2024-01-01"))
        );
        assert_eq!(table.key_of(&json!({"date": ""})), None);
        assert_eq!(table.key_of(&json!({"date": 1.5})), None);
        assert_eq!(table.key_of(&json!({"other": 1})), None);
    }

    #[test]
    fn test_schema_validation() {
        let schema = Schema::new(1)
            .table(TableSchema::keyed("entries", "date"))
            .table(TableSchema::keyed("meta", "key"));
        assert!(schema.validate().is_ok());
        assert!(schema.get("meta").is_some());

        assert!(Schema::new(1).validate().is_err());
        assert!(Schema::new(0)
            .table(TableSchema::keyed("meta", "key"))
            .validate()
            .is_err());
        assert!(Schema::new(1)
            .table(TableSchema::keyed("meta", "key"))
            .table(TableSchema::keyed("meta", "id"))
            .validate()
            .is_err());
        assert!(Schema::new(1)
            .table(TableSchema::keyed("../escape", "key"))
            .validate()
            .is_err());
    }
}

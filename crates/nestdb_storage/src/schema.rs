//! Table definitions.

use crate::error::{StorageError, StorageResult};
use crate::value::{Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Definition of a table held by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name; also the entity type name sessions use.
    pub name: String,
    /// Primary key column.
    pub primary_key: String,
    /// Whether integer keys are generated when the key column is absent or null.
    pub autoincrement: bool,
    /// Columns that must be present and non-null.
    pub required: BTreeSet<String>,
}

impl TableDef {
    /// Creates a table definition with the given primary key column.
    #[must_use]
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.into(),
            autoincrement: false,
            required: BTreeSet::new(),
        }
    }

    /// Enables autoincrement keys.
    #[must_use]
    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    /// Marks a column NOT NULL.
    #[must_use]
    pub fn required(mut self, column: impl Into<String>) -> Self {
        self.required.insert(column.into());
        self
    }

    /// Returns the primary key of `row`, if set.
    #[must_use]
    pub fn key_of(&self, row: &Row) -> Option<Value> {
        row.get(&self.primary_key)
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// Checks NOT NULL constraints for `row`.
    pub fn check_required(&self, row: &Row) -> StorageResult<()> {
        for column in &self.required {
            if row.get(column).map_or(true, Value::is_null) {
                return Err(StorageError::NotNull {
                    table: self.name.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::row;

    #[test]
    fn key_of_ignores_null() {
        let def = TableDef::new("users", "id");
        assert_eq!(def.key_of(&row([("id", Value::Null)])), None);
        assert_eq!(def.key_of(&row([("id", 4_i64)])), Some(Value::Int(4)));
    }

    #[test]
    fn required_columns() {
        let def = TableDef::new("users", "id").required("name");
        assert!(def.check_required(&row([("name", "ed")])).is_ok());
        let err = def.check_required(&row([("id", 1_i64)])).unwrap_err();
        assert!(matches!(err, StorageError::NotNull { ref column, .. } if column == "name"));
    }
}

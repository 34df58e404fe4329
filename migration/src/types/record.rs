use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{TableName, TableSchema, Value};

/// Kind of a row change.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A named column value inside a row image.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub value: Value,
    /// Whether the column identifies the row.
    pub key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, value: impl Into<Value>, key: bool) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            key,
        }
    }
}

/// A row as read from a table, with values in the table's column order.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub values: Vec<Value>,
}

impl TableRow {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Returns the integer value at `index`.
    pub fn key_at(&self, index: usize) -> Option<i64> {
        self.values.get(index).and_then(Value::as_i64)
    }

    /// Appends the canonical encoding of every value to `out`.
    pub fn encode_canonical(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.values.len() as u32).to_be_bytes());
        for value in &self.values {
            value.encode_canonical(out);
        }
    }
}

/// One change to apply on a target table.
///
/// Inventory copy produces inserts only. Change capture produces all three kinds; `before`
/// carries at least the key columns for updates and deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub change_type: ChangeType,
    pub table: TableName,
    pub before: Vec<Column>,
    pub after: Vec<Column>,
}

impl DataRecord {
    pub fn insert(table: TableName, after: Vec<Column>) -> Self {
        Self {
            change_type: ChangeType::Insert,
            table,
            before: Vec::new(),
            after,
        }
    }

    pub fn update(table: TableName, before: Vec<Column>, after: Vec<Column>) -> Self {
        Self {
            change_type: ChangeType::Update,
            table,
            before,
            after,
        }
    }

    pub fn delete(table: TableName, before: Vec<Column>) -> Self {
        Self {
            change_type: ChangeType::Delete,
            table,
            before,
            after: Vec::new(),
        }
    }

    /// Builds an insert from a row read with `schema`. `key` names the unique key column.
    pub fn from_row(table: TableName, schema: &TableSchema, key: Option<&str>, row: TableRow) -> Self {
        let after = schema
            .columns
            .iter()
            .zip(row.values)
            .map(|(column, value)| Column {
                name: column.name.clone(),
                value,
                key: match key {
                    Some(key) => column.name == key,
                    None => column.primary,
                },
            })
            .collect();

        Self::insert(table, after)
    }

    /// Row image identifying the existing row, before any key change.
    fn identity_image(&self) -> &[Column] {
        match self.change_type {
            ChangeType::Insert => &self.after,
            ChangeType::Update | ChangeType::Delete if !self.before.is_empty() => &self.before,
            _ => &self.after,
        }
    }

    /// Key columns identifying the changed row.
    pub fn key_columns(&self) -> impl Iterator<Item = &Column> {
        self.identity_image().iter().filter(|column| column.key)
    }

    /// Integer value of the first key column, used for ordering and diagnostics.
    pub fn key_value(&self) -> Option<i64> {
        self.key_columns().next().and_then(|column| column.value.as_i64())
    }

    /// Stable hash of the row identity. Changes to the same row always hash the same.
    pub fn row_hash(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.table.to_string().as_bytes());

        let mut buffer = Vec::new();
        for column in self.key_columns() {
            buffer.clear();
            column.value.encode_canonical(&mut buffer);
            hasher.update(column.name.as_bytes());
            hasher.update(&buffer);
        }

        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(prefix)
    }

    pub fn with_table(mut self, table: TableName) -> Self {
        self.table = table;
        self
    }

    pub fn after_value(&self, name: &str) -> Option<&Value> {
        self.after
            .iter()
            .find(|column| column.name == name)
            .map(|column| &column.value)
    }
}

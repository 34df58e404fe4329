use std::fmt;

use serde::{Deserialize, Serialize};

/// A table name, optionally qualified by a schema.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(schema: Option<String>, name: String) -> TableName {
        Self { schema, name }
    }

    /// Parses `schema.table` or a bare `table`.
    pub fn parse(qualified: &str) -> TableName {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::new(Some(schema.to_string()), name.to_string()),
            None => Self::new(None, qualified.to_string()),
        }
    }

    /// Returns the table name as a quoted Postgres identifier.
    pub fn as_quoted_identifier(&self) -> String {
        match &self.schema {
            Some(schema) => format!(
                "{}.{}",
                quote_identifier(schema),
                quote_identifier(&self.name)
            ),
            None => quote_identifier(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Quotes an SQL identifier, doubling embedded quotes.
pub fn quote_identifier(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for c in identifier.chars() {
        if c == '"' {
            quoted.push('"');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Dialect-neutral column type.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float8,
    Numeric,
    Text,
    Bytea,
    Date,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Jsonb,
}

impl ColumnType {
    /// Returns whether values of this type can be used as chunking keys.
    pub fn is_integer(&self) -> bool {
        matches!(self, ColumnType::Int2 | ColumnType::Int4 | ColumnType::Int8)
    }

    /// Postgres type name used in generated DDL.
    pub fn sql_name(&self) -> &'static str {
        match self {
            ColumnType::Bool => "boolean",
            ColumnType::Int2 => "smallint",
            ColumnType::Int4 => "integer",
            ColumnType::Int8 => "bigint",
            ColumnType::Float8 => "double precision",
            ColumnType::Numeric => "numeric",
            ColumnType::Text => "text",
            ColumnType::Bytea => "bytea",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
            ColumnType::TimestampTz => "timestamptz",
            ColumnType::Uuid => "uuid",
            ColumnType::Json => "json",
            ColumnType::Jsonb => "jsonb",
        }
    }

    /// Maps an `information_schema.columns.data_type` value. Unknown types are read as text.
    pub fn from_sql_name(name: &str) -> ColumnType {
        match name {
            "boolean" => ColumnType::Bool,
            "smallint" => ColumnType::Int2,
            "integer" => ColumnType::Int4,
            "bigint" => ColumnType::Int8,
            "real" | "double precision" => ColumnType::Float8,
            "numeric" | "decimal" => ColumnType::Numeric,
            "bytea" => ColumnType::Bytea,
            "date" => ColumnType::Date,
            "timestamp without time zone" | "timestamp" => ColumnType::Timestamp,
            "timestamp with time zone" | "timestamptz" => ColumnType::TimestampTz,
            "uuid" => ColumnType::Uuid,
            "json" => ColumnType::Json,
            "jsonb" => ColumnType::Jsonb,
            _ => ColumnType::Text,
        }
    }
}

/// Schema of a single column.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: ColumnType,
    pub nullable: bool,
    /// Whether the column is part of the primary key.
    pub primary: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: ColumnType, nullable: bool, primary: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
            primary,
        }
    }
}

/// Columns of a table, in ordinal order.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: TableName,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: TableName, columns: Vec<ColumnSchema>) -> Self {
        Self { name, columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Resolves the unique key column.
    ///
    /// A configured key wins. Otherwise the primary key is used when it has exactly one column.
    pub fn unique_key(&self, configured: Option<&str>) -> Option<&ColumnSchema> {
        match configured {
            Some(name) => self.column(name),
            None => {
                let mut primary = self.columns.iter().filter(|column| column.primary);
                match (primary.next(), primary.next()) {
                    (Some(column), None) => Some(column),
                    _ => None,
                }
            }
        }
    }

    /// Returns the unique key if it can drive range chunking.
    pub fn integer_unique_key(&self, configured: Option<&str>) -> Option<&ColumnSchema> {
        self.unique_key(configured)
            .filter(|column| column.data_type.is_integer())
    }

    /// Returns the names of source columns missing from `self` or declared with another type.
    pub fn incompatible_columns(&self, source: &TableSchema) -> Vec<String> {
        source
            .columns
            .iter()
            .filter(|expected| match self.column(&expected.name) {
                Some(actual) => {
                    actual.data_type != expected.data_type
                        && !(actual.data_type.is_integer() && expected.data_type.is_integer())
                }
                None => true,
            })
            .map(|column| column.name.clone())
            .collect()
    }

    /// Copies the shape of this table under another name.
    pub fn renamed(&self, name: TableName) -> TableSchema {
        TableSchema {
            name,
            columns: self.columns.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_schema() -> TableSchema {
        TableSchema::new(
            TableName::parse("t_order"),
            vec![
                ColumnSchema::new("order_id", ColumnType::Int8, false, true),
                ColumnSchema::new("user_id", ColumnType::Int4, false, false),
                ColumnSchema::new("status", ColumnType::Text, true, false),
            ],
        )
    }

    #[test]
    fn parses_qualified_names() {
        let name = TableName::parse("public.t_order");

        assert_eq!(name.schema.as_deref(), Some("public"));
        assert_eq!(name.name, "t_order");
        assert_eq!(name.to_string(), "public.t_order");
        assert_eq!(name.as_quoted_identifier(), r#""public"."t_order""#);
    }

    #[test]
    fn quotes_embedded_quotes() {
        assert_eq!(quote_identifier(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn unique_key_falls_back_to_single_primary_key() {
        let schema = order_schema();

        assert_eq!(schema.unique_key(None).map(|c| c.name.as_str()), Some("order_id"));
        assert_eq!(
            schema.unique_key(Some("user_id")).map(|c| c.name.as_str()),
            Some("user_id")
        );
        assert!(schema.integer_unique_key(Some("status")).is_none());
    }

    #[test]
    fn composite_primary_key_has_no_implicit_unique_key() {
        let mut schema = order_schema();
        schema.columns[1].primary = true;

        assert!(schema.unique_key(None).is_none());
    }

    #[test]
    fn reports_missing_and_retyped_columns() {
        let source = order_schema();
        let mut target = order_schema();
        target.columns.remove(2);
        target.columns[1].data_type = ColumnType::Int8;

        assert_eq!(target.incompatible_columns(&source), vec!["status".to_string()]);

        target.columns[0].data_type = ColumnType::Text;
        assert_eq!(
            target.incompatible_columns(&source),
            vec!["order_id".to_string(), "status".to_string()]
        );
    }
}

//! Statement text for the Postgres dialect. Identifiers are always quoted and values are
//! always bound as parameters.

use std::fmt::Write;
use std::ops::Bound;

use crate::types::{ColumnType, TableName, TableSchema, quote_identifier};

/// A column referenced by a write statement.
#[derive(Debug, Clone, Copy)]
pub(super) struct TypedColumn<'a> {
    pub name: &'a str,
    pub data_type: ColumnType,
}

/// Select list decoding into the [`ColumnType`] of each column.
pub(super) fn select_list(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|column| {
            let name = quote_identifier(&column.name);
            match column.data_type {
                // Covers `real` and any type read as text.
                ColumnType::Float8 | ColumnType::Text => {
                    format!("{name}::{}", column.data_type.sql_name())
                }
                _ => name,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Keyset page over `key`. Returns the statement and its parameters in order.
pub(super) fn range_query(
    schema: &TableSchema,
    table: &TableName,
    key: &str,
    lower: Bound<i64>,
    upper: Bound<i64>,
    limit: Option<usize>,
) -> (String, Vec<i64>) {
    let key = quote_identifier(key);
    let mut predicates = Vec::new();
    let mut params = Vec::new();

    for (bound, inclusive, exclusive) in [(lower, ">=", ">"), (upper, "<=", "<")] {
        match bound {
            Bound::Included(value) => {
                params.push(value);
                predicates.push(format!("{key} {inclusive} ${}", params.len()));
            }
            Bound::Excluded(value) => {
                params.push(value);
                predicates.push(format!("{key} {exclusive} ${}", params.len()));
            }
            Bound::Unbounded => {}
        }
    }

    let mut sql = format!(
        "select {} from {}",
        select_list(schema),
        table.as_quoted_identifier()
    );
    if !predicates.is_empty() {
        let _ = write!(sql, " where {}", predicates.join(" and "));
    }
    let _ = write!(sql, " order by {key}");
    if let Some(limit) = limit {
        let _ = write!(sql, " limit {limit}");
    }

    (sql, params)
}

/// Full scan in physical order, paged by `$1` offset and `$2` limit.
pub(super) fn sequential_query(schema: &TableSchema, table: &TableName) -> String {
    format!(
        "select {} from {} order by ctid offset $1 limit $2",
        select_list(schema),
        table.as_quoted_identifier()
    )
}

pub(super) fn key_range_query(table: &TableName, key: &str) -> String {
    let key = quote_identifier(key);
    format!(
        "select min({key})::int8 as min_key, max({key})::int8 as max_key from {}",
        table.as_quoted_identifier()
    )
}

pub(super) fn count_query(table: &TableName) -> String {
    format!("select count(*) from {}", table.as_quoted_identifier())
}

pub(super) fn create_table(schema: &TableSchema) -> String {
    let mut definitions: Vec<String> = schema
        .columns
        .iter()
        .map(|column| {
            let mut definition = format!(
                "{} {}",
                quote_identifier(&column.name),
                column.data_type.sql_name()
            );
            if !column.nullable {
                definition.push_str(" not null");
            }
            definition
        })
        .collect();

    let primary: Vec<String> = schema
        .columns
        .iter()
        .filter(|column| column.primary)
        .map(|column| quote_identifier(&column.name))
        .collect();
    if !primary.is_empty() {
        definitions.push(format!("primary key ({})", primary.join(", ")));
    }

    format!(
        "create table if not exists {} ({})",
        schema.name.as_quoted_identifier(),
        definitions.join(", ")
    )
}

fn placeholder(index: usize, column: &TypedColumn<'_>) -> String {
    format!("${index}::{}", column.data_type.sql_name())
}

/// Insert of `columns`. With `keys`, an existing row with the same key is overwritten.
pub(super) fn upsert(table: &TableName, columns: &[TypedColumn<'_>], keys: &[&str]) -> String {
    let names: Vec<String> = columns
        .iter()
        .map(|column| quote_identifier(column.name))
        .collect();
    let values: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(index, column)| placeholder(index + 1, column))
        .collect();

    let mut sql = format!(
        "insert into {} ({}) values ({})",
        table.as_quoted_identifier(),
        names.join(", "),
        values.join(", ")
    );
    if keys.is_empty() {
        return sql;
    }

    let conflict: Vec<String> = keys.iter().map(|key| quote_identifier(key)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|column| !keys.contains(&column.name))
        .map(|column| {
            let name = quote_identifier(column.name);
            format!("{name} = excluded.{name}")
        })
        .collect();

    if updates.is_empty() {
        let _ = write!(sql, " on conflict ({}) do nothing", conflict.join(", "));
    } else {
        let _ = write!(
            sql,
            " on conflict ({}) do update set {}",
            conflict.join(", "),
            updates.join(", ")
        );
    }

    sql
}

/// Predicate over `columns` starting at parameter `first`. Null-safe when `null_safe` is set.
fn matching(columns: &[TypedColumn<'_>], first: usize, null_safe: bool) -> String {
    let operator = if null_safe { "is not distinct from" } else { "=" };
    columns
        .iter()
        .enumerate()
        .map(|(offset, column)| {
            format!(
                "{} {operator} {}",
                quote_identifier(column.name),
                placeholder(first + offset, column)
            )
        })
        .collect::<Vec<_>>()
        .join(" and ")
}

/// Delete by key.
pub(super) fn delete_by_key(table: &TableName, keys: &[TypedColumn<'_>]) -> String {
    format!(
        "delete from {} where {}",
        table.as_quoted_identifier(),
        matching(keys, 1, false)
    )
}

/// Delete of one row whose columns equal `image`, for tables without a key.
pub(super) fn delete_by_image(table: &TableName, image: &[TypedColumn<'_>]) -> String {
    let table = table.as_quoted_identifier();
    format!(
        "delete from {table} where ctid = (select ctid from {table} where {} limit 1)",
        matching(image, 1, true)
    )
}

/// Update of one row whose columns equal `image`, for tables without a key.
///
/// New values take parameters `$1..` and the image follows them.
pub(super) fn update_by_image(
    table: &TableName,
    columns: &[TypedColumn<'_>],
    image: &[TypedColumn<'_>],
) -> String {
    let table = table.as_quoted_identifier();
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            format!(
                "{} = {}",
                quote_identifier(column.name),
                placeholder(index + 1, column)
            )
        })
        .collect();

    format!(
        "update {table} set {} where ctid = (select ctid from {table} where {} limit 1)",
        assignments.join(", "),
        matching(image, columns.len() + 1, true)
    )
}

pub(super) const TABLE_COLUMNS_QUERY: &str = r#"
select
    c.column_name::text as column_name,
    c.data_type::text as data_type,
    c.is_nullable = 'YES' as nullable,
    exists (
        select 1
        from information_schema.table_constraints tc
        join information_schema.key_column_usage k
            on k.constraint_name = tc.constraint_name
            and k.table_schema = tc.table_schema
            and k.table_name = tc.table_name
        where tc.constraint_type = 'PRIMARY KEY'
            and tc.table_schema = c.table_schema
            and tc.table_name = c.table_name
            and k.column_name = c.column_name
    ) as primary_key
from information_schema.columns c
where c.table_schema::text = $1 and c.table_name::text = $2
order by c.ordinal_position
"#;

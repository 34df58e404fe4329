use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use uuid::Uuid;

use crate::error::{ErrorKind, MigrationResult};
use crate::migration_error;
use crate::types::{ColumnType, TableRow, TableSchema, Value};

/// Decodes a row selected with [`super::sql::select_list`] for `schema`.
pub(super) fn decode_row(row: &PgRow, schema: &TableSchema) -> MigrationResult<TableRow> {
    let values = schema
        .columns
        .iter()
        .enumerate()
        .map(|(index, column)| decode_column(row, index, column.data_type))
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(|err| {
            migration_error!(
                ErrorKind::ConversionError,
                "Could not decode source row",
                format!("table {}: {err}", schema.name)
            )
        })?;

    Ok(TableRow::new(values))
}

fn decode_column(row: &PgRow, index: usize, data_type: ColumnType) -> Result<Value, sqlx::Error> {
    let value = match data_type {
        ColumnType::Bool => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
        ColumnType::Int2 => row
            .try_get::<Option<i16>, _>(index)?
            .map(|value| Value::I32(i32::from(value))),
        ColumnType::Int4 => row.try_get::<Option<i32>, _>(index)?.map(Value::I32),
        ColumnType::Int8 => row.try_get::<Option<i64>, _>(index)?.map(Value::I64),
        ColumnType::Float8 => row.try_get::<Option<f64>, _>(index)?.map(Value::F64),
        ColumnType::Numeric => row
            .try_get::<Option<BigDecimal>, _>(index)?
            .map(Value::Numeric),
        ColumnType::Text => row.try_get::<Option<String>, _>(index)?.map(Value::String),
        ColumnType::Bytea => row.try_get::<Option<Vec<u8>>, _>(index)?.map(Value::Bytes),
        ColumnType::Date => row.try_get::<Option<NaiveDate>, _>(index)?.map(Value::Date),
        ColumnType::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(Value::Timestamp),
        ColumnType::TimestampTz => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(Value::TimestampTz),
        ColumnType::Uuid => row.try_get::<Option<Uuid>, _>(index)?.map(Value::Uuid),
        ColumnType::Json | ColumnType::Jsonb => row
            .try_get::<Option<serde_json::Value>, _>(index)?
            .map(Value::Json),
    };

    Ok(value.unwrap_or(Value::Null))
}

/// Binds `value` as the next parameter. Statements cast every parameter to its column type, so
/// nulls can be sent untyped.
pub(super) fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(value) => query.bind(*value),
        Value::I32(value) => query.bind(*value),
        Value::I64(value) => query.bind(*value),
        Value::F64(value) => query.bind(*value),
        Value::Numeric(value) => query.bind(value.clone()),
        Value::String(value) => query.bind(value.clone()),
        Value::Bytes(value) => query.bind(value.clone()),
        Value::Date(value) => query.bind(*value),
        Value::Timestamp(value) => query.bind(*value),
        Value::TimestampTz(value) => query.bind(*value),
        Value::Uuid(value) => query.bind(*value),
        Value::Json(value) => query.bind(value.clone()),
    }
}

/// Converts a value rendered by the change capture plugin into a [`Value`] of `data_type`.
///
/// Numbers may arrive as JSON numbers or as strings. Dates and timestamps use the ISO style
/// configured on every connection.
pub(super) fn value_from_json(
    data_type: ColumnType,
    json: &serde_json::Value,
) -> MigrationResult<Value> {
    if json.is_null() {
        return Ok(Value::Null);
    }

    let invalid = || {
        migration_error!(
            ErrorKind::ConversionError,
            "Change value does not match its column type",
            format!("{json} is not a valid {}", data_type.sql_name())
        )
    };
    let text = || match json {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    };

    let value = match data_type {
        ColumnType::Bool => match json {
            serde_json::Value::Bool(value) => Value::Bool(*value),
            _ => match text().as_str() {
                "t" | "true" => Value::Bool(true),
                "f" | "false" => Value::Bool(false),
                _ => return Err(invalid()),
            },
        },
        ColumnType::Int2 | ColumnType::Int4 => {
            Value::I32(text().parse().map_err(|_| invalid())?)
        }
        ColumnType::Int8 => Value::I64(text().parse().map_err(|_| invalid())?),
        ColumnType::Float8 => Value::F64(text().parse().map_err(|_| invalid())?),
        ColumnType::Numeric => {
            Value::Numeric(BigDecimal::from_str(&text()).map_err(|_| invalid())?)
        }
        ColumnType::Text => Value::String(text()),
        ColumnType::Bytea => {
            let text = text();
            let hex = text.strip_prefix("\\x").ok_or_else(invalid)?;
            Value::Bytes(decode_hex(hex).ok_or_else(invalid)?)
        }
        ColumnType::Date => Value::Date(
            NaiveDate::parse_from_str(&text(), "%Y-%m-%d").map_err(|_| invalid())?,
        ),
        ColumnType::Timestamp => Value::Timestamp(
            NaiveDateTime::parse_from_str(&text(), "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|_| invalid())?,
        ),
        ColumnType::TimestampTz => Value::TimestampTz(parse_timestamptz(&text()).ok_or_else(invalid)?),
        ColumnType::Uuid => Value::Uuid(Uuid::parse_str(&text()).map_err(|_| invalid())?),
        ColumnType::Json | ColumnType::Jsonb => match json {
            serde_json::Value::String(text) => {
                Value::Json(serde_json::from_str(text).map_err(|_| invalid())?)
            }
            other => Value::Json(other.clone()),
        },
    };

    Ok(value)
}

/// Parses `2024-01-02 03:04:05.123+00` as printed with `datestyle = ISO`.
pub(super) fn parse_timestamptz(text: &str) -> Option<DateTime<Utc>> {
    // Offsets may be printed as `+HH`, which chrono only accepts as `+HH:MM` or `+HHMM`.
    let normalized = match text.rfind(['+', '-']) {
        Some(at) if text.len() - at == 3 => format!("{text}:00"),
        _ => text.to_string(),
    };

    DateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f%:z")
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }

    (0..hex.len())
        .step_by(2)
        .map(|at| u8::from_str_radix(hex.get(at..at + 2)?, 16).ok())
        .collect()
}

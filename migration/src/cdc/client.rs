//! Consumer side helpers: building requests and turning received records back into native
//! values.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate};
use uuid::Uuid;

use crate::bail;
use crate::cdc::importer::UNIX_EPOCH_DAYS_FROM_CE;
use crate::cdc::password_digest;
use crate::cdc::protocol::{
    AckStreamingRequest, CdcRequest, DataChangeType, LoginRequest, Record, StopStreamingRequest,
    StreamDataRequest, TableColumn, TypedValue, cdc_request, typed_value,
};
use crate::error::{ErrorKind, MigrationResult};
use crate::migration_error;
use crate::types::{ChangeType, Column, DataRecord, TableName, Value};

/// Builds requests with increasing request ids.
#[derive(Debug, Default)]
pub struct CdcClient {
    next_request_id: u64,
}

impl CdcClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login(&mut self, username: &str, password: &str) -> CdcRequest {
        self.request(cdc_request::Body::Login(LoginRequest {
            username: username.to_string(),
            password_digest: password_digest(password),
        }))
    }

    pub fn stream_data(&mut self, database: &str, tables: &[&str], full: bool) -> CdcRequest {
        self.request(cdc_request::Body::StreamData(StreamDataRequest {
            database: database.to_string(),
            source_schema_tables: tables.iter().map(|table| table.to_string()).collect(),
            full,
        }))
    }

    pub fn ack(&mut self, ack_id: &str) -> CdcRequest {
        self.request(cdc_request::Body::AckStreaming(AckStreamingRequest {
            ack_id: ack_id.to_string(),
        }))
    }

    pub fn stop_streaming(&mut self, streaming_id: &str) -> CdcRequest {
        self.request(cdc_request::Body::StopStreaming(StopStreamingRequest {
            streaming_id: streaming_id.to_string(),
        }))
    }

    fn request(&mut self, body: cdc_request::Body) -> CdcRequest {
        self.next_request_id += 1;

        CdcRequest {
            request_id: self.next_request_id.to_string(),
            body: Some(body),
        }
    }
}

/// Converts a received record into a [`DataRecord`].
pub fn decode_record(record: Record) -> MigrationResult<DataRecord> {
    let change_type = match DataChangeType::try_from(record.data_change_type) {
        Ok(DataChangeType::Insert) => ChangeType::Insert,
        Ok(DataChangeType::Update) => ChangeType::Update,
        Ok(DataChangeType::Delete) => ChangeType::Delete,
        Ok(DataChangeType::Unknown) | Err(_) => bail!(
            ErrorKind::ProtocolError,
            "CDC record has no change type",
            format!("data change type {}", record.data_change_type)
        ),
    };
    let Some(metadata) = record.metadata else {
        bail!(ErrorKind::ProtocolError, "CDC record has no metadata");
    };

    let schema = (!metadata.schema.is_empty()).then_some(metadata.schema);

    Ok(DataRecord {
        change_type,
        table: TableName::new(schema, metadata.table),
        before: decode_columns(record.before)?,
        after: decode_columns(record.after)?,
    })
}

fn decode_columns(columns: Vec<TableColumn>) -> MigrationResult<Vec<Column>> {
    columns
        .into_iter()
        .map(|column| {
            let value = match column.value {
                Some(value) => decode_value(value)?,
                None => Value::Null,
            };

            Ok(Column {
                name: column.name,
                value,
                key: column.key,
            })
        })
        .collect()
}

pub fn decode_value(value: TypedValue) -> MigrationResult<Value> {
    let Some(kind) = value.kind else {
        return Ok(Value::Null);
    };

    let value = match kind {
        typed_value::Kind::Null(_) => Value::Null,
        typed_value::Kind::Bool(value) => Value::Bool(value),
        typed_value::Kind::Int32(value) => Value::I32(value),
        typed_value::Kind::Int64(value) => Value::I64(value),
        typed_value::Kind::Double(value) => Value::F64(value),
        typed_value::Kind::String(value) => Value::String(value),
        typed_value::Kind::Bytes(value) => Value::Bytes(value),
        typed_value::Kind::Decimal(value) => {
            Value::Numeric(BigDecimal::from_str(&value).map_err(|err| {
                migration_error!(ErrorKind::ConversionError, "Invalid decimal value", err)
            })?)
        }
        typed_value::Kind::TimestampMillis(millis) => Value::TimestampTz(timestamp(millis)?),
        typed_value::Kind::LocalTimestampMillis(millis) => {
            Value::Timestamp(timestamp(millis)?.naive_utc())
        }
        typed_value::Kind::DateDays(days) => {
            let date = days
                .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
                .and_then(NaiveDate::from_num_days_from_ce_opt)
                .ok_or_else(|| {
                    migration_error!(ErrorKind::ConversionError, "Date is out of range", days)
                })?;
            Value::Date(date)
        }
        typed_value::Kind::Uuid(value) => Value::Uuid(Uuid::parse_str(&value).map_err(|err| {
            migration_error!(ErrorKind::ConversionError, "Invalid uuid value", err)
        })?),
        typed_value::Kind::Json(value) => Value::Json(serde_json::from_str(&value)?),
    };

    Ok(value)
}

fn timestamp(millis: i64) -> MigrationResult<DateTime<chrono::Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        migration_error!(ErrorKind::ConversionError, "Timestamp is out of range", millis)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::importer::{encode_record, encode_value};
    use crate::test_utils::table::t_order;

    #[test]
    fn values_survive_the_typed_encoding() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::I32(-7),
            Value::I64(1 << 40),
            Value::F64(1.5),
            Value::Numeric(BigDecimal::from_str("12.340").unwrap()),
            Value::String("paid".to_string()),
            Value::Bytes(vec![0, 1, 255]),
            Value::Date(NaiveDate::from_ymd_opt(1969, 12, 31).unwrap()),
            Value::Timestamp(
                NaiveDate::from_ymd_opt(2024, 2, 29)
                    .unwrap()
                    .and_hms_milli_opt(23, 59, 58, 125)
                    .unwrap(),
            ),
            Value::TimestampTz(DateTime::from_timestamp_millis(1_700_000_000_123).unwrap()),
            Value::Uuid(Uuid::from_u128(42)),
            Value::Json(serde_json::json!({"items": [1, 2]})),
        ];

        for value in values {
            assert_eq!(decode_value(encode_value(&value)).unwrap(), value);
        }
    }

    #[test]
    fn records_keep_their_images_and_keys() {
        let record = DataRecord::update(
            TableName::new(Some("public".to_string()), "t_order".to_string()),
            vec![Column::new("order_id", 1i64, true)],
            vec![
                Column::new("order_id", 1i64, true),
                Column::new("status", "paid", false),
            ],
        );

        assert_eq!(decode_record(encode_record(&record)).unwrap(), record);
    }

    #[test]
    fn records_without_change_type_are_rejected() {
        let mut record = encode_record(&DataRecord::delete(
            t_order(),
            vec![Column::new("order_id", 1i64, true)],
        ));
        record.data_change_type = DataChangeType::Unknown as i32;

        let err = decode_record(record).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn request_ids_increase() {
        let mut client = CdcClient::new();

        let login = client.login("root", "secret");
        let ack = client.ack("1");

        assert_eq!(login.request_id, "1");
        assert_eq!(ack.request_id, "2");
    }
}

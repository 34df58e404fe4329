use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Datelike;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

use crate::bail;
use crate::cdc::protocol::{
    DataChangeType, DataRecordResult, MetaData, Record, TableColumn, TypedValue, typed_value,
};
use crate::dialect::{DataSource, Dialect, Importer};
use crate::error::{ErrorKind, MigrationResult};
use crate::types::{ChangeType, Column, DataRecord, TableName, TableSchema, Value};

/// Days between 0001-01-01 and 1970-01-01.
pub(crate) const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Default time a consumer has to acknowledge a batch.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Confirms that a consumer durably received a batch.
#[derive(Debug)]
pub struct CdcAck(oneshot::Sender<()>);

impl CdcAck {
    pub fn acknowledge(self) {
        // The writer may have given up on the batch already.
        let _ = self.0.send(());
    }
}

/// A batch of records waiting for a consumer.
#[derive(Debug)]
pub struct CdcBatch {
    result: DataRecordResult,
    ack: CdcAck,
}

impl CdcBatch {
    pub fn ack_id(&self) -> &str {
        &self.result.ack_id
    }

    pub fn records(&self) -> &[Record] {
        &self.result.records
    }

    pub fn into_parts(self) -> (DataRecordResult, CdcAck) {
        (self.result, self.ack)
    }
}

/// Consumer side of a CDC channel.
#[derive(Debug)]
pub struct CdcStream {
    batch_rx: mpsc::Receiver<CdcBatch>,
}

impl CdcStream {
    /// Waits for the next batch. Returns `None` once every importer is dropped.
    pub async fn next(&mut self) -> Option<CdcBatch> {
        self.batch_rx.recv().await
    }
}

/// Creates an importer and the stream its batches are delivered to.
///
/// At most `capacity` batches wait in the channel. Every write waits until its batch is
/// acknowledged.
pub fn cdc_channel(capacity: usize, ack_timeout: Duration) -> (CdcImporter, CdcStream) {
    let (batch_tx, batch_rx) = mpsc::channel(capacity.max(1));
    let importer = CdcImporter {
        batch_tx,
        next_ack_id: Arc::new(AtomicU64::new(1)),
        ack_timeout,
    };

    (importer, CdcStream { batch_rx })
}

/// An [`Importer`] that hands applied records to a CDC consumer instead of a database.
///
/// A write completes once the consumer acknowledges its batch, so progress is only
/// checkpointed for records the consumer has.
#[derive(Debug, Clone)]
pub struct CdcImporter {
    batch_tx: mpsc::Sender<CdcBatch>,
    next_ack_id: Arc<AtomicU64>,
    ack_timeout: Duration,
}

impl DataSource for CdcImporter {
    async fn check_connection(&self) -> MigrationResult<()> {
        if self.batch_tx.is_closed() {
            bail!(ErrorKind::TargetConnectionFailed, "CDC consumer is gone");
        }

        Ok(())
    }

    async fn table_schema(&self, _table: &TableName) -> MigrationResult<Option<TableSchema>> {
        Ok(None)
    }
}

impl Importer for CdcImporter {
    async fn create_table(&self, _schema: &TableSchema) -> MigrationResult<bool> {
        // Consumers own their storage.
        Ok(true)
    }

    async fn write(&self, records: &[DataRecord]) -> MigrationResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let ack_id = self.next_ack_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (ack_tx, ack_rx) = oneshot::channel();
        let batch = CdcBatch {
            result: DataRecordResult {
                records: records.iter().map(encode_record).collect(),
                ack_id: ack_id.clone(),
            },
            ack: CdcAck(ack_tx),
        };

        if self.batch_tx.send(batch).await.is_err() {
            bail!(ErrorKind::TargetConnectionFailed, "CDC consumer is gone");
        }

        match timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(())) => {
                debug!(ack_id, records = records.len(), "cdc batch acknowledged");
                Ok(())
            }
            Ok(Err(_)) => bail!(
                ErrorKind::TargetWriteFailed,
                "CDC batch was dropped without acknowledgement",
                format!("ack id {ack_id}")
            ),
            Err(_) => bail!(
                ErrorKind::TargetWriteFailed,
                "CDC batch was not acknowledged in time",
                format!("ack id {ack_id} after {:?}", self.ack_timeout)
            ),
        }
    }
}

/// Reads from a wrapped dialect and writes to a CDC consumer.
#[derive(Debug, Clone)]
pub struct CdcDialect<D> {
    source: D,
    importer: CdcImporter,
}

impl<D> CdcDialect<D> {
    pub fn new(source: D, importer: CdcImporter) -> Self {
        Self { source, importer }
    }
}

impl<D: Dialect> Dialect for CdcDialect<D> {
    type Source = D::Source;
    type Target = CdcImporter;

    fn name(&self) -> &'static str {
        "cdc"
    }

    async fn connect_source(&self, name: &str) -> MigrationResult<D::Source> {
        self.source.connect_source(name).await
    }

    async fn connect_target(&self, _name: &str) -> MigrationResult<CdcImporter> {
        Ok(self.importer.clone())
    }

    fn is_same_database(&self, _source: &str, _target: &str) -> bool {
        false
    }
}

pub fn encode_record(record: &DataRecord) -> Record {
    let data_change_type = match record.change_type {
        ChangeType::Insert => DataChangeType::Insert,
        ChangeType::Update => DataChangeType::Update,
        ChangeType::Delete => DataChangeType::Delete,
    };

    Record {
        metadata: Some(MetaData {
            schema: record.table.schema.clone().unwrap_or_default(),
            table: record.table.name.clone(),
        }),
        data_change_type: data_change_type as i32,
        before: record.before.iter().map(encode_column).collect(),
        after: record.after.iter().map(encode_column).collect(),
    }
}

fn encode_column(column: &Column) -> TableColumn {
    TableColumn {
        name: column.name.clone(),
        value: Some(encode_value(&column.value)),
        key: column.key,
    }
}

pub fn encode_value(value: &Value) -> TypedValue {
    let kind = match value {
        Value::Null => typed_value::Kind::Null(true),
        Value::Bool(value) => typed_value::Kind::Bool(*value),
        Value::I32(value) => typed_value::Kind::Int32(*value),
        Value::I64(value) => typed_value::Kind::Int64(*value),
        Value::F64(value) => typed_value::Kind::Double(*value),
        Value::Numeric(value) => typed_value::Kind::Decimal(value.to_string()),
        Value::String(value) => typed_value::Kind::String(value.clone()),
        Value::Bytes(value) => typed_value::Kind::Bytes(value.clone()),
        Value::Date(value) => {
            typed_value::Kind::DateDays(value.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
        }
        Value::Timestamp(value) => {
            typed_value::Kind::LocalTimestampMillis(value.and_utc().timestamp_millis())
        }
        Value::TimestampTz(value) => typed_value::Kind::TimestampMillis(value.timestamp_millis()),
        Value::Uuid(value) => typed_value::Kind::Uuid(value.to_string()),
        Value::Json(value) => typed_value::Kind::Json(value.to_string()),
    };

    TypedValue { kind: Some(kind) }
}

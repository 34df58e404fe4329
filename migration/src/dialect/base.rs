use std::future::Future;
use std::ops::Bound;

use chrono::{DateTime, Utc};

use crate::error::MigrationResult;
use crate::position::IncrementalPosition;
use crate::types::{DataRecord, TableName, TableRow, TableSchema};

/// Smallest and largest value of an integer unique key.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KeyRange {
    pub min: i64,
    pub max: i64,
}

/// A page of rows ordered by an integer unique key.
#[derive(Debug, Clone)]
pub struct RangeQuery<'a> {
    pub table: &'a TableName,
    pub key: &'a str,
    pub lower: Bound<i64>,
    pub upper: Bound<i64>,
    pub limit: Option<usize>,
}

/// Identifies the change stream of one job item.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChangeFeed {
    /// Stable name, usable as a replication slot name.
    pub name: String,
    pub tables: Vec<TableName>,
}

impl ChangeFeed {
    pub fn new(job_id: &str, item: u32, tables: Vec<TableName>) -> Self {
        let name = format!("migration_{job_id}_{item}")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();

        Self { name, tables }
    }
}

/// One captured change with its position in the source change log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub position: IncrementalPosition,
    pub record: DataRecord,
    pub committed_at: Option<DateTime<Utc>>,
}

/// Operations shared by every data source handle.
pub trait DataSource {
    /// Fails when the data source cannot be reached.
    fn check_connection(&self) -> impl Future<Output = MigrationResult<()>> + Send;

    /// Returns the schema of `table`, or `None` if it does not exist.
    fn table_schema(
        &self,
        table: &TableName,
    ) -> impl Future<Output = MigrationResult<Option<TableSchema>>> + Send;

    /// Releases connections held by this handle.
    fn close(&self) -> impl Future<Output = MigrationResult<()>> + Send {
        async { Ok(()) }
    }
}

/// Reads existing rows.
pub trait Dumper: DataSource {
    /// Returns the key range of `table`, or `None` when it is empty.
    fn key_range(
        &self,
        table: &TableName,
        key: &str,
    ) -> impl Future<Output = MigrationResult<Option<KeyRange>>> + Send;

    fn count_rows(&self, table: &TableName) -> impl Future<Output = MigrationResult<u64>> + Send;

    /// Returns rows inside the query bounds in ascending key order.
    fn dump_range(
        &self,
        query: RangeQuery<'_>,
    ) -> impl Future<Output = MigrationResult<Vec<TableRow>>> + Send;

    /// Returns rows of a table without a usable key, in a stable order.
    fn dump_sequential(
        &self,
        table: &TableName,
        offset: u64,
        limit: usize,
    ) -> impl Future<Output = MigrationResult<Vec<TableRow>>> + Send;
}

/// Writes rows and changes.
///
/// Writes are idempotent by unique key: inserts and updates overwrite an existing row, and
/// deleting a missing row does nothing.
pub trait Importer: DataSource {
    /// Creates the table if it does not exist. Returns whether it was created.
    fn create_table(
        &self,
        schema: &TableSchema,
    ) -> impl Future<Output = MigrationResult<bool>> + Send;

    /// Applies `records` in order. Either all records are applied or none.
    fn write(&self, records: &[DataRecord]) -> impl Future<Output = MigrationResult<()>> + Send;
}

/// Captures changes of a source.
pub trait PositionProvider {
    fn supports_change_capture(&self) -> bool;

    /// Establishes the change stream for `feed` and returns its current position.
    ///
    /// Every change committed after this call is returned by [`PositionProvider::poll_changes`].
    fn init_position(
        &self,
        feed: &ChangeFeed,
    ) -> impl Future<Output = MigrationResult<IncrementalPosition>> + Send;

    /// Returns up to `limit` changes after `after`, in commit order.
    fn poll_changes(
        &self,
        feed: &ChangeFeed,
        after: IncrementalPosition,
        limit: usize,
    ) -> impl Future<Output = MigrationResult<Vec<ChangeEvent>>> + Send;

    /// Lets the source discard changes up to `position`.
    fn acknowledge(
        &self,
        feed: &ChangeFeed,
        position: IncrementalPosition,
    ) -> impl Future<Output = MigrationResult<()>> + Send;

    /// Drops the change stream of `feed`.
    fn release(&self, feed: &ChangeFeed) -> impl Future<Output = MigrationResult<()>> + Send;
}

/// A family of data sources selected by configuration.
pub trait Dialect: Clone + Send + Sync + 'static {
    type Source: Dumper + PositionProvider + Clone + Send + Sync + 'static;
    type Target: Importer + Clone + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    /// Opens a handle for reading from the data source `name`.
    fn connect_source(
        &self,
        name: &str,
    ) -> impl Future<Output = MigrationResult<Self::Source>> + Send;

    /// Opens a handle for writing to the data source `name`.
    fn connect_target(
        &self,
        name: &str,
    ) -> impl Future<Output = MigrationResult<Self::Target>> + Send;

    /// Whether both names resolve to the same physical database.
    fn is_same_database(&self, source: &str, target: &str) -> bool;
}

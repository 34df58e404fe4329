//! A fully functional in-process database with a change log.
//!
//! Used by tests and local dry runs. Source-side mutation helpers append to the change log the
//! same way a database appends to its write-ahead log, so inventory copy and change capture can
//! be exercised against one consistent data set.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeBounds;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::bail;
use crate::dialect::{
    ChangeEvent, ChangeFeed, DataSource, Dialect, Dumper, Importer, KeyRange, PositionProvider,
    RangeQuery,
};
use crate::error::{ErrorKind, MigrationResult};
use crate::position::IncrementalPosition;
use crate::types::{ChangeType, Column, DataRecord, TableName, TableRow, TableSchema, Value};

/// Identity of a row inside a memory table.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
enum RowKey {
    Int(i64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    /// Indices of the columns identifying a row. Every column when there is no primary key.
    key_indices: Vec<usize>,
    rows: BTreeMap<RowKey, TableRow>,
}

impl MemoryTable {
    fn new(schema: TableSchema) -> Self {
        let mut key_indices: Vec<usize> = schema
            .columns
            .iter()
            .enumerate()
            .filter(|(_, column)| column.primary)
            .map(|(index, _)| index)
            .collect();
        if key_indices.is_empty() {
            key_indices = (0..schema.columns.len()).collect();
        }

        Self {
            schema,
            key_indices,
            rows: BTreeMap::new(),
        }
    }

    fn key_of(&self, row: &TableRow) -> RowKey {
        if let [index] = self.key_indices.as_slice()
            && let Some(key) = row.key_at(*index)
        {
            return RowKey::Int(key);
        }

        let mut bytes = Vec::new();
        for index in &self.key_indices {
            row.values
                .get(*index)
                .unwrap_or(&Value::Null)
                .encode_canonical(&mut bytes);
        }
        RowKey::Bytes(bytes)
    }

    /// Builds a row from a change image. Columns missing from the image keep `base` values.
    fn row_from_image(&self, image: &[Column], base: Option<&TableRow>) -> TableRow {
        let values = self
            .schema
            .columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                image
                    .iter()
                    .find(|candidate| candidate.name == column.name)
                    .map(|candidate| candidate.value.clone())
                    .or_else(|| base.and_then(|row| row.values.get(index).cloned()))
                    .unwrap_or(Value::Null)
            })
            .collect();

        TableRow::new(values)
    }

    fn image(&self, row: &TableRow) -> Vec<Column> {
        self.schema
            .columns
            .iter()
            .zip(&row.values)
            .map(|(column, value)| Column::new(column.name.clone(), value.clone(), column.primary))
            .collect()
    }

    fn column_index(&self, name: &str) -> MigrationResult<usize> {
        match self.schema.columns.iter().position(|column| column.name == name) {
            Some(index) => Ok(index),
            None => bail!(
                ErrorKind::SourceQueryFailed,
                "Column does not exist",
                format!("column `{name}` of table {}", self.schema.name)
            ),
        }
    }

    fn apply(&mut self, record: &DataRecord) {
        match record.change_type {
            ChangeType::Insert => {
                let row = self.row_from_image(&record.after, None);
                self.rows.insert(self.key_of(&row), row);
            }
            ChangeType::Update => {
                let identity = if record.before.is_empty() {
                    &record.after
                } else {
                    &record.before
                };
                let old_key = self.key_of(&self.row_from_image(identity, None));
                let old_row = self.rows.remove(&old_key);
                let row = self.row_from_image(&record.after, old_row.as_ref());
                self.rows.insert(self.key_of(&row), row);
            }
            ChangeType::Delete => {
                let key = self.key_of(&self.row_from_image(&record.before, None));
                self.rows.remove(&key);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<TableName, MemoryTable>,
    change_log: Vec<ChangeEvent>,
    next_sequence: u64,
    feeds: HashMap<String, u64>,
    reachable: bool,
    fail_init_position: bool,
    pending_write_failures: u32,
    pending_ddl_failures: u32,
    ddl_statements: u64,
    writes: u64,
}

/// An in-process database.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<Inner>>,
    change_capture: Arc<AtomicBool>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        let inner = Inner {
            reachable: true,
            ..Inner::default()
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
            change_capture: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn same_as(&self, other: &MemoryDatabase) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Creates a table directly, bypassing DDL accounting.
    pub async fn create_table(&self, schema: TableSchema) {
        let mut inner = self.inner.lock().await;
        inner
            .tables
            .entry(schema.name.clone())
            .or_insert_with(|| MemoryTable::new(schema));
    }

    /// Inserts rows and logs them as changes.
    pub async fn insert_rows(&self, table: &TableName, rows: Vec<Vec<Value>>) -> MigrationResult<()> {
        let mut inner = self.inner.lock().await;
        for values in rows {
            let memory_table = table_mut(&mut inner, table)?;
            let row = TableRow::new(values);
            let after = memory_table.image(&row);
            let record = DataRecord::insert(table.clone(), after);
            memory_table.apply(&record);
            self.log_change(&mut inner, record);
        }

        Ok(())
    }

    /// Updates columns of the row with integer key `key` and logs the change.
    pub async fn update_row(
        &self,
        table: &TableName,
        key: i64,
        changes: Vec<(&str, Value)>,
    ) -> MigrationResult<()> {
        let mut inner = self.inner.lock().await;
        let memory_table = table_mut(&mut inner, table)?;
        let Some(existing) = memory_table.rows.get(&RowKey::Int(key)).cloned() else {
            bail!(
                ErrorKind::SourceQueryFailed,
                "Row does not exist",
                format!("key {key} of table {table}")
            );
        };

        let mut updated = existing.clone();
        for (name, value) in changes {
            let index = memory_table.column_index(name)?;
            updated.values[index] = value;
        }

        let record = DataRecord::update(
            table.clone(),
            memory_table.image(&existing),
            memory_table.image(&updated),
        );
        memory_table.apply(&record);
        self.log_change(&mut inner, record);

        Ok(())
    }

    /// Deletes the row with integer key `key` and logs the change.
    pub async fn delete_row(&self, table: &TableName, key: i64) -> MigrationResult<()> {
        let mut inner = self.inner.lock().await;
        let memory_table = table_mut(&mut inner, table)?;
        let Some(existing) = memory_table.rows.get(&RowKey::Int(key)).cloned() else {
            return Ok(());
        };

        let record = DataRecord::delete(table.clone(), memory_table.image(&existing));
        memory_table.apply(&record);
        self.log_change(&mut inner, record);

        Ok(())
    }

    /// Returns all rows of `table` in key order.
    pub async fn rows(&self, table: &TableName) -> Vec<TableRow> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|memory_table| memory_table.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row(&self, table: &TableName, key: i64) -> Option<TableRow> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .and_then(|memory_table| memory_table.rows.get(&RowKey::Int(key)).cloned())
    }

    pub async fn has_table(&self, table: &TableName) -> bool {
        self.inner.lock().await.tables.contains_key(table)
    }

    pub async fn set_reachable(&self, reachable: bool) {
        self.inner.lock().await.reachable = reachable;
    }

    /// Disables or enables change capture. Changes made while disabled are not logged.
    pub fn set_supports_change_capture(&self, supported: bool) {
        self.change_capture.store(supported, Ordering::Release);
    }

    pub async fn set_fail_init_position(&self, fail: bool) {
        self.inner.lock().await.fail_init_position = fail;
    }

    /// Makes the next `count` writes fail with a retryable error.
    pub async fn fail_next_writes(&self, count: u32) {
        self.inner.lock().await.pending_write_failures = count;
    }

    /// Makes the next `count` DDL statements fail.
    pub async fn fail_next_ddl(&self, count: u32) {
        self.inner.lock().await.pending_ddl_failures = count;
    }

    /// Number of DDL statements received by importers.
    pub async fn ddl_statements(&self) -> u64 {
        self.inner.lock().await.ddl_statements
    }

    /// Number of successful importer writes.
    pub async fn writes(&self) -> u64 {
        self.inner.lock().await.writes
    }

    /// Number of changes in the change log.
    pub async fn change_log_len(&self) -> usize {
        self.inner.lock().await.change_log.len()
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

fn table_mut<'a>(inner: &'a mut Inner, table: &TableName) -> MigrationResult<&'a mut MemoryTable> {
    match inner.tables.get_mut(table) {
        Some(memory_table) => Ok(memory_table),
        None => bail!(
            ErrorKind::MissingTable,
            "Table does not exist",
            format!("table {table}")
        ),
    }
}

impl MemoryDatabase {
    fn log_change(&self, inner: &mut Inner, record: DataRecord) {
        if !self.change_capture.load(Ordering::Acquire) {
            return;
        }

        inner.next_sequence += 1;
        let event = ChangeEvent {
            position: IncrementalPosition::Sequence(inner.next_sequence),
            record,
            committed_at: Some(Utc::now()),
        };
        inner.change_log.push(event);
    }
}

/// Whether a handle reads from or writes to its database. Selects the reported error kinds.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Role {
    Source,
    Target,
}

/// A connection to a [`MemoryDatabase`].
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    database: MemoryDatabase,
    role: Role,
}

impl MemoryHandle {
    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    async fn lock(&self) -> MigrationResult<tokio::sync::MutexGuard<'_, Inner>> {
        let inner = self.database.inner.lock().await;
        if !inner.reachable {
            let kind = match self.role {
                Role::Source => ErrorKind::SourceConnectionFailed,
                Role::Target => ErrorKind::TargetConnectionFailed,
            };
            bail!(kind, "Memory database is unreachable");
        }

        Ok(inner)
    }
}

impl DataSource for MemoryHandle {
    async fn check_connection(&self) -> MigrationResult<()> {
        self.lock().await.map(|_| ())
    }

    async fn table_schema(&self, table: &TableName) -> MigrationResult<Option<TableSchema>> {
        let inner = self.lock().await?;
        Ok(inner
            .tables
            .get(table)
            .map(|memory_table| memory_table.schema.clone()))
    }
}

impl Dumper for MemoryHandle {
    async fn key_range(&self, table: &TableName, key: &str) -> MigrationResult<Option<KeyRange>> {
        let mut inner = self.lock().await?;
        let memory_table = table_mut(&mut inner, table)?;
        let index = memory_table.column_index(key)?;

        let keys = memory_table
            .rows
            .values()
            .filter_map(|row| row.key_at(index));
        let range = keys.fold(None, |range: Option<KeyRange>, key| match range {
            Some(range) => Some(KeyRange {
                min: range.min.min(key),
                max: range.max.max(key),
            }),
            None => Some(KeyRange { min: key, max: key }),
        });

        Ok(range)
    }

    async fn count_rows(&self, table: &TableName) -> MigrationResult<u64> {
        let mut inner = self.lock().await?;
        Ok(table_mut(&mut inner, table)?.rows.len() as u64)
    }

    async fn dump_range(&self, query: RangeQuery<'_>) -> MigrationResult<Vec<TableRow>> {
        let mut inner = self.lock().await?;
        let memory_table = table_mut(&mut inner, query.table)?;
        let index = memory_table.column_index(query.key)?;

        let mut rows: Vec<(i64, TableRow)> = memory_table
            .rows
            .values()
            .filter_map(|row| row.key_at(index).map(|key| (key, row)))
            .filter(|(key, _)| (query.lower, query.upper).contains(key))
            .map(|(key, row)| (key, row.clone()))
            .collect();
        rows.sort_by_key(|(key, _)| *key);

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows.into_iter().take(limit).map(|(_, row)| row).collect())
    }

    async fn dump_sequential(
        &self,
        table: &TableName,
        offset: u64,
        limit: usize,
    ) -> MigrationResult<Vec<TableRow>> {
        let mut inner = self.lock().await?;
        let memory_table = table_mut(&mut inner, table)?;

        Ok(memory_table
            .rows
            .values()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl Importer for MemoryHandle {
    async fn create_table(&self, schema: &TableSchema) -> MigrationResult<bool> {
        let mut inner = self.lock().await?;
        inner.ddl_statements += 1;
        if inner.pending_ddl_failures > 0 {
            inner.pending_ddl_failures -= 1;
            bail!(
                ErrorKind::SchemaPreparationFailed,
                "Table creation failed",
                format!("injected failure creating {}", schema.name)
            );
        }
        if inner.tables.contains_key(&schema.name) {
            return Ok(false);
        }

        inner
            .tables
            .insert(schema.name.clone(), MemoryTable::new(schema.clone()));
        Ok(true)
    }

    async fn write(&self, records: &[DataRecord]) -> MigrationResult<()> {
        let mut inner = self.lock().await?;
        if inner.pending_write_failures > 0 {
            inner.pending_write_failures -= 1;
            bail!(ErrorKind::TargetWriteFailed, "Injected write failure");
        }

        // Validate first so a batch is applied entirely or not at all.
        for record in records {
            table_mut(&mut inner, &record.table)?;
        }
        for record in records {
            table_mut(&mut inner, &record.table)?.apply(record);
        }
        inner.writes += 1;

        Ok(())
    }
}

impl PositionProvider for MemoryHandle {
    fn supports_change_capture(&self) -> bool {
        self.database.change_capture.load(Ordering::Acquire)
    }

    async fn init_position(&self, feed: &ChangeFeed) -> MigrationResult<IncrementalPosition> {
        let mut inner = self.lock().await?;
        if inner.fail_init_position || !self.supports_change_capture() {
            bail!(
                ErrorKind::PositionAcquisitionFailed,
                "Could not establish the change stream",
                format!("feed `{}`", feed.name)
            );
        }

        let current = inner.next_sequence;
        let acknowledged = inner.feeds.entry(feed.name.clone()).or_insert(current);

        Ok(IncrementalPosition::Sequence((*acknowledged).max(current)))
    }

    async fn poll_changes(
        &self,
        feed: &ChangeFeed,
        after: IncrementalPosition,
        limit: usize,
    ) -> MigrationResult<Vec<ChangeEvent>> {
        let inner = self.lock().await?;
        let IncrementalPosition::Sequence(after) = after else {
            bail!(
                ErrorKind::InvalidPosition,
                "Memory change log positions are sequences",
                format!("got {after}")
            );
        };
        if !inner.feeds.contains_key(&feed.name) {
            bail!(
                ErrorKind::PositionAcquisitionFailed,
                "Change stream does not exist",
                format!("feed `{}`", feed.name)
            );
        }

        Ok(inner
            .change_log
            .iter()
            .filter(|event| matches!(event.position, IncrementalPosition::Sequence(s) if s > after))
            .filter(|event| feed.tables.contains(&event.record.table))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn acknowledge(
        &self,
        feed: &ChangeFeed,
        position: IncrementalPosition,
    ) -> MigrationResult<()> {
        let mut inner = self.lock().await?;
        if let IncrementalPosition::Sequence(sequence) = position
            && let Some(acknowledged) = inner.feeds.get_mut(&feed.name)
        {
            *acknowledged = (*acknowledged).max(sequence);
        }

        Ok(())
    }

    async fn release(&self, feed: &ChangeFeed) -> MigrationResult<()> {
        let mut inner = self.lock().await?;
        inner.feeds.remove(&feed.name);

        Ok(())
    }
}

/// Resolves data source names to registered [`MemoryDatabase`]s.
#[derive(Debug, Clone, Default)]
pub struct MemoryDialect {
    databases: Arc<std::sync::RwLock<HashMap<String, MemoryDatabase>>>,
}

impl MemoryDialect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `database` under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, database: MemoryDatabase) {
        if let Ok(mut databases) = self.databases.write() {
            databases.insert(name.into(), database);
        }
    }

    pub fn database(&self, name: &str) -> Option<MemoryDatabase> {
        self.databases
            .read()
            .ok()
            .and_then(|databases| databases.get(name).cloned())
    }

    fn resolve(&self, name: &str, role: Role) -> MigrationResult<MemoryHandle> {
        match self.database(name) {
            Some(database) => Ok(MemoryHandle { database, role }),
            None => bail!(
                ErrorKind::ConfigError,
                "Memory data source is not registered",
                format!("data source `{name}`")
            ),
        }
    }
}

impl Dialect for MemoryDialect {
    type Source = MemoryHandle;
    type Target = MemoryHandle;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect_source(&self, name: &str) -> MigrationResult<MemoryHandle> {
        self.resolve(name, Role::Source)
    }

    async fn connect_target(&self, name: &str) -> MigrationResult<MemoryHandle> {
        self.resolve(name, Role::Target)
    }

    fn is_same_database(&self, source: &str, target: &str) -> bool {
        match (self.database(source), self.database(target)) {
            (Some(source), Some(target)) => source.same_as(&target),
            _ => false,
        }
    }
}

//! Postgres data sources, read and written over sqlx. Changes are captured through a logical
//! replication slot using the `wal2json` output plugin.

mod decode;
mod sql;
mod wal2json;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use config::shared::{DataSourceConfig, PgConnectionConfig, ProcessConfig};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bail;
use crate::dialect::{
    ChangeEvent, ChangeFeed, DataSource, Dialect, Dumper, Importer, KeyRange, PositionProvider,
    RangeQuery,
};
use crate::error::{ErrorKind, MigrationError, MigrationResult, is_connectivity_error};
use crate::migration_error;
use crate::position::{IncrementalPosition, Lsn};
use crate::types::{
    ChangeType, Column, ColumnSchema, ColumnType, DataRecord, TableName, TableRow, TableSchema,
    Value,
};

use self::decode::{bind_value, decode_row};
use self::sql::TypedColumn;

/// Schema assumed for unqualified table names.
const DEFAULT_SCHEMA: &str = "public";

const PEEK_CHANGES_QUERY: &str = r#"
select lsn::text, data
from pg_logical_slot_peek_changes(
    $1::name, null, $2,
    'format-version', '2',
    'include-timestamp', '1',
    'include-pk', '1',
    'numeric-data-types-as-string', '1',
    'add-tables', $3
)
"#;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Role {
    Source,
    Target,
}

/// A pool of connections to one Postgres database.
#[derive(Debug, Clone)]
pub struct PgHandle {
    pool: PgPool,
    data_source: String,
    role: Role,
    schemas: Arc<Mutex<HashMap<TableName, TableSchema>>>,
    /// Change counts of polled transactions by commit, per feed.
    transactions: Arc<Mutex<HashMap<String, BTreeMap<Lsn, u32>>>>,
}

impl PgHandle {
    fn error(&self, description: &'static str, err: sqlx::Error) -> MigrationError {
        let kind = match (is_connectivity_error(&err), self.role) {
            (true, Role::Source) => ErrorKind::SourceConnectionFailed,
            (true, Role::Target) => ErrorKind::TargetConnectionFailed,
            (false, Role::Source) => ErrorKind::SourceQueryFailed,
            (false, Role::Target) => ErrorKind::TargetWriteFailed,
        };

        migration_error!(
            kind,
            description,
            format!("data source `{}`: {err}", self.data_source),
            source: err
        )
    }

    fn position_error(&self, description: &'static str, err: sqlx::Error) -> MigrationError {
        if is_connectivity_error(&err) {
            return self.error(description, err);
        }

        migration_error!(
            ErrorKind::PositionAcquisitionFailed,
            description,
            format!("data source `{}`: {err}", self.data_source),
            source: err
        )
    }

    async fn require_schema(&self, table: &TableName) -> MigrationResult<TableSchema> {
        match self.table_schema(table).await? {
            Some(schema) => Ok(schema),
            None => bail!(
                ErrorKind::MissingTable,
                "Table does not exist",
                format!("table {table} in data source `{}`", self.data_source)
            ),
        }
    }

    async fn apply_record(
        &self,
        conn: &mut PgConnection,
        schema: &TableSchema,
        record: &DataRecord,
    ) -> MigrationResult<()> {
        let keys: Vec<&str> = schema
            .columns
            .iter()
            .filter(|column| column.primary)
            .map(|column| column.name.as_str())
            .collect();

        match record.change_type {
            ChangeType::Insert => self.upsert(conn, schema, &keys, &record.after).await,
            ChangeType::Update if keys.is_empty() => {
                let columns = typed_columns(schema, &record.after)?;
                let image = typed_columns(schema, &record.before)?;
                let statement = sql::update_by_image(&record.table, &columns, &image);
                let values = record.after.iter().chain(&record.before).map(|c| &c.value);
                self.execute(conn, &statement, values).await
            }
            ChangeType::Update => {
                let before = project(&record.before, &keys);
                if before.is_some() && before != project(&record.after, &keys) {
                    self.delete_by_key(conn, schema, &keys, &record.before)
                        .await?;
                }
                self.upsert(conn, schema, &keys, &record.after).await
            }
            ChangeType::Delete if keys.is_empty() => {
                let image = typed_columns(schema, &record.before)?;
                let statement = sql::delete_by_image(&record.table, &image);
                let values = record.before.iter().map(|column| &column.value);
                self.execute(conn, &statement, values).await
            }
            ChangeType::Delete => {
                self.delete_by_key(conn, schema, &keys, &record.before)
                    .await
            }
        }
    }

    async fn upsert(
        &self,
        conn: &mut PgConnection,
        schema: &TableSchema,
        keys: &[&str],
        image: &[Column],
    ) -> MigrationResult<()> {
        let columns = typed_columns(schema, image)?;
        let statement = sql::upsert(&schema.name, &columns, keys);

        self.execute(conn, &statement, image.iter().map(|column| &column.value))
            .await
    }

    async fn delete_by_key(
        &self,
        conn: &mut PgConnection,
        schema: &TableSchema,
        keys: &[&str],
        image: &[Column],
    ) -> MigrationResult<()> {
        let Some(key_values) = project(image, keys) else {
            bail!(
                ErrorKind::TargetWriteFailed,
                "Change image does not contain the key",
                format!("table {}, key {}", schema.name, keys.join(", "))
            );
        };
        let key_columns: Vec<Column> = keys
            .iter()
            .zip(&key_values)
            .map(|(name, value)| Column::new(*name, (*value).clone(), true))
            .collect();
        let statement = sql::delete_by_key(&schema.name, &typed_columns(schema, &key_columns)?);

        self.execute(conn, &statement, key_values).await
    }

    async fn execute<'a>(
        &self,
        conn: &mut PgConnection,
        statement: &str,
        values: impl IntoIterator<Item = &'a Value>,
    ) -> MigrationResult<()> {
        let mut query = sqlx::query(statement);
        for value in values {
            query = bind_value(query, value);
        }

        query
            .execute(&mut *conn)
            .await
            .map_err(|err| self.error("Could not apply change", err))?;

        Ok(())
    }

    async fn peek(
        &self,
        feed: &ChangeFeed,
        tables: &str,
        changes: usize,
    ) -> MigrationResult<Vec<(String, String)>> {
        let rows = sqlx::query(PEEK_CHANGES_QUERY)
            .bind(&feed.name)
            .bind(i32::try_from(changes).unwrap_or(i32::MAX))
            .bind(tables)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| self.position_error("Could not read the replication slot", err))?;

        rows.iter()
            .map(|row| Ok((row.try_get::<String, _>(0)?, row.try_get::<String, _>(1)?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|err| self.position_error("Could not decode replication slot output", err))
    }
}

/// Resolves `image` columns against `schema` to get their types.
fn typed_columns<'a>(
    schema: &'a TableSchema,
    image: &'a [Column],
) -> MigrationResult<Vec<TypedColumn<'a>>> {
    image
        .iter()
        .map(|column| match schema.column(&column.name) {
            Some(ColumnSchema { data_type, .. }) => Ok(TypedColumn {
                name: &column.name,
                data_type: *data_type,
            }),
            None => bail!(
                ErrorKind::TargetWriteFailed,
                "Column does not exist on the target table",
                format!("column {} of {}", column.name, schema.name)
            ),
        })
        .collect()
}

/// Values of the `keys` columns of `image`, or `None` when one is missing.
fn project<'a>(image: &'a [Column], keys: &[&str]) -> Option<Vec<&'a Value>> {
    keys.iter()
        .map(|key| {
            image
                .iter()
                .find(|column| column.name == *key)
                .map(|column| &column.value)
        })
        .collect()
}

impl DataSource for PgHandle {
    async fn check_connection(&self) -> MigrationResult<()> {
        sqlx::query("select 1")
            .execute(&self.pool)
            .await
            .map_err(|err| self.error("Data source is not reachable", err))?;

        Ok(())
    }

    async fn table_schema(&self, table: &TableName) -> MigrationResult<Option<TableSchema>> {
        if let Some(schema) = self.schemas.lock().await.get(table) {
            return Ok(Some(schema.clone()));
        }

        let rows = sqlx::query(sql::TABLE_COLUMNS_QUERY)
            .bind(table.schema.as_deref().unwrap_or(DEFAULT_SCHEMA))
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| self.error("Could not read table schema", err))?;
        if rows.is_empty() {
            return Ok(None);
        }

        let columns = rows
            .iter()
            .map(|row| {
                let data_type: String = row.try_get("data_type")?;
                Ok(ColumnSchema::new(
                    row.try_get::<String, _>("column_name")?,
                    ColumnType::from_sql_name(&data_type),
                    row.try_get("nullable")?,
                    row.try_get("primary_key")?,
                ))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|err| self.error("Could not decode table schema", err))?;

        let schema = TableSchema::new(table.clone(), columns);
        self.schemas
            .lock()
            .await
            .insert(table.clone(), schema.clone());

        Ok(Some(schema))
    }

    async fn close(&self) -> MigrationResult<()> {
        self.pool.close().await;

        Ok(())
    }
}

impl Dumper for PgHandle {
    async fn key_range(&self, table: &TableName, key: &str) -> MigrationResult<Option<KeyRange>> {
        let row = sqlx::query(&sql::key_range_query(table, key))
            .fetch_one(&self.pool)
            .await
            .map_err(|err| self.error("Could not read key range", err))?;

        let min: Option<i64> = row
            .try_get("min_key")
            .map_err(|err| self.error("Could not decode key range", err))?;
        let max: Option<i64> = row
            .try_get("max_key")
            .map_err(|err| self.error("Could not decode key range", err))?;

        Ok(min.zip(max).map(|(min, max)| KeyRange { min, max }))
    }

    async fn count_rows(&self, table: &TableName) -> MigrationResult<u64> {
        let count: i64 = sqlx::query_scalar(&sql::count_query(table))
            .fetch_one(&self.pool)
            .await
            .map_err(|err| self.error("Could not count rows", err))?;

        Ok(count.max(0) as u64)
    }

    async fn dump_range(&self, query: RangeQuery<'_>) -> MigrationResult<Vec<TableRow>> {
        let schema = self.require_schema(query.table).await?;
        let (statement, params) = sql::range_query(
            &schema,
            query.table,
            query.key,
            query.lower,
            query.upper,
            query.limit,
        );

        let mut select = sqlx::query(&statement);
        for param in params {
            select = select.bind(param);
        }
        let rows = select
            .fetch_all(&self.pool)
            .await
            .map_err(|err| self.error("Could not dump key range", err))?;

        rows.iter().map(|row| decode_row(row, &schema)).collect()
    }

    async fn dump_sequential(
        &self,
        table: &TableName,
        offset: u64,
        limit: usize,
    ) -> MigrationResult<Vec<TableRow>> {
        let schema = self.require_schema(table).await?;
        let rows = sqlx::query(&sql::sequential_query(&schema, table))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| self.error("Could not dump table", err))?;

        rows.iter().map(|row| decode_row(row, &schema)).collect()
    }
}

impl Importer for PgHandle {
    async fn create_table(&self, schema: &TableSchema) -> MigrationResult<bool> {
        if self.table_schema(&schema.name).await?.is_some() {
            return Ok(false);
        }

        sqlx::query(&sql::create_table(schema))
            .execute(&self.pool)
            .await
            .map_err(|err| {
                migration_error!(
                    ErrorKind::SchemaPreparationFailed,
                    "Could not create target table",
                    format!("table {}: {err}", schema.name),
                    source: err
                )
            })?;
        info!(table = %schema.name, data_source = %self.data_source, "created target table");

        Ok(true)
    }

    async fn write(&self, records: &[DataRecord]) -> MigrationResult<()> {
        let mut schemas: HashMap<&TableName, TableSchema> = HashMap::new();
        for record in records {
            if !schemas.contains_key(&record.table) {
                schemas.insert(&record.table, self.require_schema(&record.table).await?);
            }
        }

        let mut transaction = self
            .pool
            .begin()
            .await
            .map_err(|err| self.error("Could not begin write transaction", err))?;
        for record in records {
            let Some(schema) = schemas.get(&record.table) else {
                bail!(ErrorKind::MissingTable, "Table does not exist", record.table);
            };
            self.apply_record(&mut transaction, schema, record).await?;
        }
        transaction
            .commit()
            .await
            .map_err(|err| self.error("Could not commit write transaction", err))?;

        Ok(())
    }
}

impl PositionProvider for PgHandle {
    fn supports_change_capture(&self) -> bool {
        true
    }

    async fn init_position(&self, feed: &ChangeFeed) -> MigrationResult<IncrementalPosition> {
        let wal_level: String = sqlx::query_scalar("show wal_level")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| self.position_error("Could not read wal_level", err))?;
        if wal_level != "logical" {
            bail!(
                ErrorKind::PositionAcquisitionFailed,
                "Logical decoding is not enabled",
                format!("data source `{}` has wal_level {wal_level}", self.data_source)
            );
        }

        let exists: bool = sqlx::query_scalar(
            "select exists (select 1 from pg_replication_slots where slot_name = $1::name)",
        )
        .bind(&feed.name)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| self.position_error("Could not look up the replication slot", err))?;
        if !exists {
            sqlx::query("select pg_create_logical_replication_slot($1::name, $2::name)")
                .bind(&feed.name)
                .bind(wal2json::PLUGIN)
                .execute(&self.pool)
                .await
                .map_err(|err| self.position_error("Could not create the replication slot", err))?;
            info!(slot = %feed.name, "created replication slot");
        }

        let current: String = sqlx::query_scalar("select pg_current_wal_lsn()::text")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| self.position_error("Could not read the current WAL position", err))?;

        Ok(IncrementalPosition::after_commit(current.parse()?))
    }

    async fn poll_changes(
        &self,
        feed: &ChangeFeed,
        after: IncrementalPosition,
        limit: usize,
    ) -> MigrationResult<Vec<ChangeEvent>> {
        if !matches!(after, IncrementalPosition::Lsn { .. }) {
            bail!(
                ErrorKind::InvalidPosition,
                "Postgres change positions are log sequence numbers",
                format!("got {after}")
            );
        }

        let tables = wal2json::add_tables_option(&feed.tables);
        let limit = limit.max(1);
        // Peeking restarts at the slot's confirmed position, so changes already polled but not
        // yet acknowledged come back first. Read further until something new shows up.
        let mut requested = limit;
        loop {
            let rows = self.peek(feed, &tables, requested).await?;
            let exhausted = rows.len() < requested;
            let transactions = wal2json::parse_transactions(rows)?;

            {
                let mut polled = self.transactions.lock().await;
                let sizes = polled.entry(feed.name.clone()).or_default();
                for transaction in &transactions {
                    sizes.insert(transaction.commit, transaction.events.len() as u32);
                }
            }

            let events: Vec<ChangeEvent> = transactions
                .into_iter()
                .flat_map(|transaction| transaction.events)
                .filter(|event| event.position > after)
                .take(limit)
                .collect();
            if !events.is_empty() || exhausted {
                return Ok(events);
            }

            requested = requested.saturating_mul(2);
            debug!(slot = %feed.name, requested, "peeking further past polled changes");
        }
    }

    async fn acknowledge(
        &self,
        feed: &ChangeFeed,
        position: IncrementalPosition,
    ) -> MigrationResult<()> {
        let IncrementalPosition::Lsn { commit, index } = position else {
            bail!(
                ErrorKind::InvalidPosition,
                "Postgres change positions are log sequence numbers",
                format!("got {position}")
            );
        };

        // The slot only moves past whole transactions, so a partly applied one is kept.
        let confirmed = {
            let mut polled = self.transactions.lock().await;
            let sizes = polled.entry(feed.name.clone()).or_default();
            let complete = index == u32::MAX
                || sizes
                    .get(&commit)
                    .is_some_and(|size| index.saturating_add(1) >= *size);
            let confirmed = if complete {
                Some(commit)
            } else {
                sizes.range(..commit).next_back().map(|(lsn, _)| *lsn)
            };
            if let Some(confirmed) = confirmed {
                sizes.retain(|lsn, _| *lsn > confirmed);
            }
            confirmed
        };
        let Some(confirmed) = confirmed else {
            return Ok(());
        };

        sqlx::query(
            r#"
            select pg_replication_slot_advance(slot_name, $2::pg_lsn)
            from pg_replication_slots
            where slot_name = $1::name and confirmed_flush_lsn < $2::pg_lsn
            "#,
        )
        .bind(&feed.name)
        .bind(confirmed.to_string())
        .execute(&self.pool)
        .await
        .map_err(|err| self.position_error("Could not advance the replication slot", err))?;
        debug!(slot = %feed.name, %confirmed, "advanced replication slot");

        Ok(())
    }

    async fn release(&self, feed: &ChangeFeed) -> MigrationResult<()> {
        sqlx::query(
            "select pg_drop_replication_slot(slot_name) from pg_replication_slots where slot_name = $1::name",
        )
        .bind(&feed.name)
        .execute(&self.pool)
        .await
        .map_err(|err| self.position_error("Could not drop the replication slot", err))?;
        self.transactions.lock().await.remove(&feed.name);
        info!(slot = %feed.name, "dropped replication slot");

        Ok(())
    }
}

/// Opens [`PgHandle`]s to the configured Postgres data sources.
#[derive(Debug, Clone)]
pub struct PgDialect {
    data_sources: Arc<BTreeMap<String, PgConnectionConfig>>,
    max_connections: u32,
    connect_timeout: Duration,
}

impl PgDialect {
    pub fn new(
        data_sources: BTreeMap<String, PgConnectionConfig>,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            data_sources: Arc::new(data_sources),
            max_connections,
            connect_timeout,
        }
    }

    /// Keeps the Postgres entries of `data_sources`. Pools are sized for the readers and
    /// writers `process` runs at once.
    pub fn from_config(
        data_sources: &BTreeMap<String, DataSourceConfig>,
        process: &ProcessConfig,
    ) -> Self {
        let postgres = data_sources
            .iter()
            .filter_map(|(name, config)| match config {
                DataSourceConfig::Postgres(config) => Some((name.clone(), config.clone())),
                DataSourceConfig::Memory { .. } => None,
            })
            .collect();
        let connections = process.worker_threads.max(process.write_concurrency) + 1;

        Self::new(
            postgres,
            u32::try_from(connections).unwrap_or(u32::MAX),
            Duration::from_millis(process.connect_timeout_ms),
        )
    }

    async fn connect(&self, name: &str, role: Role) -> MigrationResult<PgHandle> {
        let Some(config) = self.data_sources.get(name) else {
            bail!(
                ErrorKind::ConfigError,
                "Postgres data source is not configured",
                format!("data source `{name}`")
            );
        };

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect_with(config.connect_options())
            .await
            .map_err(|err| {
                let kind = match role {
                    Role::Source => ErrorKind::SourceConnectionFailed,
                    Role::Target => ErrorKind::TargetConnectionFailed,
                };
                migration_error!(
                    kind,
                    "Could not connect to data source",
                    format!("data source `{name}`: {err}"),
                    source: err
                )
            })?;

        Ok(PgHandle {
            pool,
            data_source: name.to_string(),
            role,
            schemas: Arc::default(),
            transactions: Arc::default(),
        })
    }
}

impl Dialect for PgDialect {
    type Source = PgHandle;
    type Target = PgHandle;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect_source(&self, name: &str) -> MigrationResult<PgHandle> {
        self.connect(name, Role::Source).await
    }

    async fn connect_target(&self, name: &str) -> MigrationResult<PgHandle> {
        self.connect(name, Role::Target).await
    }

    fn is_same_database(&self, source: &str, target: &str) -> bool {
        match (self.data_sources.get(source), self.data_sources.get(target)) {
            (Some(source), Some(target)) => {
                source.host == target.host
                    && source.port == target.port
                    && source.name == target.name
            }
            _ => false,
        }
    }
}

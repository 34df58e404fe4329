//! Brings a job item from configured to ready to run.
//!
//! Preparation holds the job-scoped lock while it mutates state shared by every item of the
//! job: target tables and the statuses of all items. The incremental start position is
//! captured before any inventory task exists, so every change committed after the inventory
//! reads is guaranteed to be in the change stream.

use std::sync::Arc;
use std::time::Duration;

use config::shared::TableMapping;
use tracing::{debug, info, warn};

use crate::bail;
use crate::concurrency::shutdown::ShutdownResult;
use crate::coordination::{Barrier, LockService, PREPARE_SUCCESS_MILESTONE, Registry, keys};
use crate::dialect::{ChangeFeed, DataSource, Dialect, Dumper, Importer, PositionProvider};
use crate::error::{ErrorKind, MigrationError, MigrationResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{
    PREPARE__BEFORE_CREATE_TABLES, PREPARE__BEFORE_INIT_POSITION, migration_fail_point,
};
use crate::job::JobItemContext;
use crate::migration_error;
use crate::position::IncrementalPosition;
use crate::progress::{JobItemProgress, JobItemStatus};
use crate::rate_limit::RateLimiter;
use crate::splitter::InventoryTaskSplitter;
use crate::task::{IncrementalTask, InventoryTask, TableTaskConfig, TaskConfig};
use crate::types::{TableName, TableSchema};

/// Tasks of a prepared job item.
pub struct PreparedTasks<D: Dialect> {
    pub task_config: TaskConfig,
    pub inventory: Vec<InventoryTask<D>>,
    pub incremental: Option<IncrementalTask<D>>,
}

/// Prepares job items under the job-scoped lock of a [`LockService`].
#[derive(Debug, Clone)]
pub struct JobPreparer<L> {
    lock_service: L,
    lock_timeout: Duration,
    connect_timeout: Duration,
}

impl<L: LockService> JobPreparer<L> {
    pub fn new(lock_service: L, lock_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            lock_service,
            lock_timeout,
            connect_timeout,
        }
    }

    /// Prepares the item of `context` and builds its tasks.
    ///
    /// Returns [`ShutdownResult::Shutdown`] without side effects when the item is stopped
    /// before the lock is taken, including while it waits for the lock.
    pub async fn prepare<D, R>(
        &self,
        context: &JobItemContext<D, R>,
    ) -> MigrationResult<ShutdownResult<PreparedTasks<D>, ()>>
    where
        D: Dialect,
        R: Registry,
    {
        self.check_connectivity(context).await?;

        if context.is_stopping() {
            info!(job_id = context.job_id(), item = context.item(), "stopping before preparation");
            return Ok(ShutdownResult::Shutdown(()));
        }

        let lock_name = keys::lock(context.job_id());
        let mut shutdown_rx = context.shutdown_rx().clone();
        let locked = tokio::select! {
            biased;
            _ = shutdown_rx.wait() => {
                info!(job_id = context.job_id(), item = context.item(), "stopping while waiting for the preparation lock");
                return Ok(ShutdownResult::Shutdown(()));
            }
            locked = self.lock_service.try_lock(&lock_name, self.lock_timeout) => locked?,
        };
        let Some(guard) = locked else {
            bail!(
                ErrorKind::LockTimeout,
                "Timed out waiting for the job preparation lock",
                format!("lock `{lock_name}` not acquired within {:?}", self.lock_timeout)
            );
        };
        debug!(job_id = context.job_id(), item = context.item(), "preparation lock acquired");

        let prepared = self.prepare_locked(context).await;
        if let Err(err) = self.lock_service.unlock(guard).await {
            warn!(job_id = context.job_id(), error = %err, "failed to release preparation lock");
        }
        let start_position = prepared?;

        let task_config = self.build_task_config(context, start_position).await?;
        let tasks = self.build_tasks(context, task_config).await?;

        info!(
            job_id = context.job_id(),
            item = context.item(),
            inventory_tasks = tasks.inventory.len(),
            incremental = tasks.incremental.is_some(),
            "job item prepared"
        );

        Ok(ShutdownResult::Ok(tasks))
    }

    async fn check_connectivity<D, R>(&self, context: &JobItemContext<D, R>) -> MigrationResult<()>
    where
        D: Dialect,
        R: Registry,
    {
        let check = async { context.source().await?.check_connection().await };
        match tokio::time::timeout(self.connect_timeout, check).await {
            Ok(result) => result,
            Err(_) => bail!(
                ErrorKind::SourceConnectionFailed,
                "Source connectivity check timed out",
                format!("data source `{}`", context.job_config().source)
            ),
        }
    }

    /// Runs under the job lock. Returns the incremental start position of the item.
    async fn prepare_locked<D, R>(
        &self,
        context: &JobItemContext<D, R>,
    ) -> MigrationResult<Option<IncrementalPosition>>
    where
        D: Dialect,
        R: Registry,
    {
        let repository = context.repository();
        if let Some(persisted) = repository
            .load_progress(context.job_id(), context.item())
            .await?
        {
            context.progress().reload(persisted).await;
        }

        let status = context.progress().status().await;
        if status.needs_preparation() {
            info!(job_id = context.job_id(), item = context.item(), %status, "preparing job item");
            context.progress().set_status(JobItemStatus::Preparing).await?;
            context.persist_progress().await?;

            if let Err(err) = self.prepare_target(context).await {
                context
                    .progress()
                    .fail(JobItemStatus::PreparingFailure, err.to_string())
                    .await?;
                context.persist_progress().await?;

                return Err(err);
            }

            self.broadcast_prepare_success(context).await?;
        } else {
            debug!(job_id = context.job_id(), item = context.item(), %status, "job item already prepared");
        }

        let position = self.capture_start_position(context).await?;
        context.persist_progress().await?;

        Barrier::new(repository.registry().clone())
            .signal(context.job_id(), PREPARE_SUCCESS_MILESTONE, context.item())
            .await?;

        Ok(position)
    }

    /// Creates the target tables of every table of the job, or validates them when source and
    /// target are the same database.
    async fn prepare_target<D, R>(&self, context: &JobItemContext<D, R>) -> MigrationResult<()>
    where
        D: Dialect,
        R: Registry,
    {
        #[cfg(feature = "failpoints")]
        migration_fail_point(PREPARE__BEFORE_CREATE_TABLES)?;

        let source = context.source().await?;
        let target = context.target().await?;
        let same_database = context.is_same_database();

        for mapping in &context.job_config().tables {
            let source_schema = load_source_schema(source, mapping).await?;
            let target_name = TableName::parse(&mapping.target_table);

            if same_database {
                validate_target_table(target, &source_schema, &target_name).await?;
                continue;
            }

            let target_schema = source_schema.renamed(target_name.clone());
            match target.create_table(&target_schema).await {
                Ok(true) => info!(table = %target_name, "target table created"),
                Ok(false) => {
                    validate_target_table(target, &source_schema, &target_name).await?;
                    debug!(table = %target_name, "target table already exists");
                }
                Err(err) => return Err(into_schema_error(err, &target_name)),
            }
        }

        Ok(())
    }

    /// Marks every item of the job prepared, since the target tables are shared.
    async fn broadcast_prepare_success<D, R>(
        &self,
        context: &JobItemContext<D, R>,
    ) -> MigrationResult<()>
    where
        D: Dialect,
        R: Registry,
    {
        let repository = context.repository();
        for item in 0..context.job_config().sharding_total_count {
            if item == context.item() {
                context
                    .progress()
                    .advance_status(JobItemStatus::PrepareSuccess)
                    .await?;
                context.persist_progress().await?;
                continue;
            }

            let mut progress = repository
                .load_progress(context.job_id(), item)
                .await?
                .unwrap_or_else(JobItemProgress::default);
            if progress.status.needs_preparation() {
                progress.set_status(JobItemStatus::PrepareSuccess)?;
                progress.error_message = None;
                repository
                    .persist_progress(context.job_id(), item, &progress)
                    .await?;
            }
        }

        info!(job_id = context.job_id(), "all job items marked prepared");

        Ok(())
    }

    async fn capture_start_position<D, R>(
        &self,
        context: &JobItemContext<D, R>,
    ) -> MigrationResult<Option<IncrementalPosition>>
    where
        D: Dialect,
        R: Registry,
    {
        if let Some(position) = context.progress().incremental_position().await {
            return Ok(Some(position));
        }

        let source = context.source().await?;
        if !source.supports_change_capture() {
            info!(job_id = context.job_id(), item = context.item(), "source has no change capture");
            return Ok(None);
        }

        let feed = feed_of(context)?;
        let position = async {
            #[cfg(feature = "failpoints")]
            migration_fail_point(PREPARE__BEFORE_INIT_POSITION)?;

            source.init_position(&feed).await
        }
        .await
        .map_err(|err| {
            if err.kind() == ErrorKind::PositionAcquisitionFailed {
                err
            } else {
                migration_error!(
                    ErrorKind::PositionAcquisitionFailed,
                    "Could not capture the incremental start position",
                    format!("feed `{}`", feed.name),
                    source: err
                )
            }
        })?;

        info!(job_id = context.job_id(), item = context.item(), %position, "incremental start position captured");
        context.progress().set_incremental_position(position, None).await;

        Ok(Some(position))
    }

    async fn build_task_config<D, R>(
        &self,
        context: &JobItemContext<D, R>,
        start_position: Option<IncrementalPosition>,
    ) -> MigrationResult<TaskConfig>
    where
        D: Dialect,
        R: Registry,
    {
        let job_config = context.job_config();
        let source = context.source().await?;

        let mut tables = Vec::new();
        for mapping in job_config.tables_for_item(context.item()) {
            tables.push(load_table_task_config(source, mapping).await?);
        }

        let mut task_config = TaskConfig::new(context.job_id(), context.item(), job_config, tables);
        task_config.start_position = start_position;

        Ok(task_config)
    }

    async fn build_tasks<D, R>(
        &self,
        context: &JobItemContext<D, R>,
        task_config: TaskConfig,
    ) -> MigrationResult<PreparedTasks<D>>
    where
        D: Dialect,
        R: Registry,
    {
        let source = context.source().await?.clone();
        let target = context.target().await?.clone();
        let progress = context.progress();

        let mut inventory = Vec::new();
        let mut split_chunks = false;
        if task_config.full {
            if progress.inventory_records_count() == 0 {
                let mut total = 0;
                for table in &task_config.tables {
                    total += source.count_rows(&table.source_table).await?;
                }
                progress.init_inventory_records_count(total);
            }

            let persisted = progress.inventory_positions().await;
            let splitter = InventoryTaskSplitter::new(task_config.dumper.batch_size);
            let rate_limiter = task_config
                .importer
                .records_per_second
                .map(RateLimiter::new);

            for table in &task_config.tables {
                let chunks = splitter
                    .split_table(&source, table.clone(), &persisted)
                    .await?;
                for chunk in chunks {
                    if !persisted.contains_key(&chunk.id) {
                        split_chunks = true;
                        progress
                            .set_inventory_position(&chunk.id, chunk.position)
                            .await;
                    }
                    inventory.push(InventoryTask::new(
                        task_config.job_id.clone(),
                        task_config.item,
                        chunk,
                        source.clone(),
                        target.clone(),
                        task_config.dumper,
                        task_config.importer.clone(),
                        progress.clone(),
                        rate_limiter.clone(),
                    ));
                }
            }
        }

        // New chunks are persisted before any of them runs.
        if split_chunks {
            context.persist_progress().await?;
        }

        let incremental = if source.supports_change_capture() {
            Some(IncrementalTask::new(
                task_config.job_id.clone(),
                task_config.item,
                source.clone(),
                target.clone(),
                task_config.feed.clone(),
                task_config.tables.clone(),
                task_config.incremental,
                task_config.importer.clone(),
                task_config.start_position,
                progress.clone(),
            ))
        } else {
            None
        };

        Ok(PreparedTasks {
            task_config,
            inventory,
            incremental,
        })
    }
}

fn feed_of<D, R>(context: &JobItemContext<D, R>) -> MigrationResult<ChangeFeed>
where
    D: Dialect,
    R: Registry,
{
    let tables = context
        .job_config()
        .tables_for_item(context.item())
        .into_iter()
        .map(|mapping| TableName::parse(&mapping.source_table))
        .collect::<Vec<_>>();
    if tables.is_empty() {
        bail!(
            ErrorKind::ConfigError,
            "Job item has no tables",
            format!("item {} of job {}", context.item(), context.job_id())
        );
    }

    Ok(ChangeFeed::new(
        context.job_id(),
        context.item(),
        tables,
    ))
}

async fn load_source_schema<S: DataSource>(
    source: &S,
    mapping: &TableMapping,
) -> MigrationResult<TableSchema> {
    let name = TableName::parse(&mapping.source_table);
    match source.table_schema(&name).await? {
        Some(schema) => Ok(schema),
        None => bail!(
            ErrorKind::MissingTable,
            "Source table does not exist",
            format!("table {name}")
        ),
    }
}

/// Loads the schema of a mapped table and resolves its unique key.
///
/// A configured key must exist. Keys that are not integers cannot be split, so such tables
/// are copied as one unsplit chunk.
pub(crate) async fn load_table_task_config<S: DataSource>(
    source: &S,
    mapping: &TableMapping,
) -> MigrationResult<Arc<TableTaskConfig>> {
    let source_schema = load_source_schema(source, mapping).await?;
    let configured = mapping.unique_key.as_deref();

    if let Some(configured) = configured
        && source_schema.column(configured).is_none()
    {
        bail!(
            ErrorKind::MissingUniqueKey,
            "Configured unique key does not exist",
            format!("column `{configured}` of table {}", source_schema.name)
        );
    }

    let unique_key = source_schema
        .integer_unique_key(configured)
        .map(|column| column.name.clone());
    if unique_key.is_none() {
        warn!(table = %source_schema.name, "table has no integer unique key, copying it unsplit");
    }

    Ok(Arc::new(TableTaskConfig {
        source_table: source_schema.name.clone(),
        target_table: TableName::parse(&mapping.target_table),
        unique_key,
        source_schema,
    }))
}

async fn validate_target_table<T: DataSource>(
    target: &T,
    source_schema: &TableSchema,
    target_name: &TableName,
) -> MigrationResult<()> {
    let Some(target_schema) = target.table_schema(target_name).await? else {
        bail!(
            ErrorKind::SchemaPreparationFailed,
            "Target table does not exist",
            format!("table {target_name}")
        );
    };

    let incompatible = target_schema.incompatible_columns(source_schema);
    if !incompatible.is_empty() {
        bail!(
            ErrorKind::SchemaPreparationFailed,
            "Target table does not match the source table",
            format!("table {target_name}, columns {}", incompatible.join(", "))
        );
    }

    Ok(())
}

fn into_schema_error(err: MigrationError, table: &TableName) -> MigrationError {
    if err.kind() == ErrorKind::SchemaPreparationFailed {
        return err;
    }

    migration_error!(
        ErrorKind::SchemaPreparationFailed,
        "Could not create target table",
        format!("table {table}"),
        source: err
    )
}

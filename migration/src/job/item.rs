use std::sync::Arc;
use std::time::Duration;

use config::shared::RetryConfig;
use metrics::gauge;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, create_shutdown_channel};
use crate::coordination::{Barrier, LockService, Registry, STOPPED_MILESTONE};
use crate::dialect::Dialect;
use crate::error::{ErrorKind, MigrationError, MigrationResult};
use crate::job::{JobItemContext, ProgressPersister};
use crate::metrics::{ITEM_LABEL, JOB_ID_LABEL, MIGRATION_JOB_ITEMS_RUNNING};
use crate::migration_error;
use crate::preparer::{JobPreparer, PreparedTasks};
use crate::progress::JobItemStatus;
use crate::task::retry::with_retries;
use crate::task::{InventoryTask, InventoryTaskResult};

/// Runs one sharding item: prepare, copy the inventory, then stream changes until stopped.
pub struct JobItemRunner<D: Dialect, R, L> {
    context: Arc<JobItemContext<D, R>>,
    preparer: JobPreparer<L>,
    retry: RetryConfig,
    checkpoint_interval: Duration,
}

impl<D, R, L> JobItemRunner<D, R, L>
where
    D: Dialect,
    R: Registry,
    L: LockService,
{
    pub fn new(context: Arc<JobItemContext<D, R>>, preparer: JobPreparer<L>) -> Self {
        let process = &context.job_config().process;
        let retry = process.retry.clone();
        let checkpoint_interval = Duration::from_millis(process.checkpoint_interval_ms);

        Self {
            context,
            preparer,
            retry,
            checkpoint_interval,
        }
    }

    pub fn context(&self) -> &Arc<JobItemContext<D, R>> {
        &self.context
    }

    /// Runs the item to completion or until it is stopped. Resources are always released.
    pub async fn run(self) -> MigrationResult<()> {
        let context = self.context.clone();
        let job_id = context.job_id().to_string();
        let item = context.item();

        let running = gauge!(
            MIGRATION_JOB_ITEMS_RUNNING,
            JOB_ID_LABEL => job_id.clone(),
            ITEM_LABEL => item.to_string(),
        );
        running.increment(1.0);

        let result = match self.resume().await {
            Ok(true) => self.run_with_persister().await,
            Ok(false) => Ok(()),
            Err(err) => {
                error!(job_id = %job_id, item, error = %err, "job item cannot run");
                Err(err)
            }
        };

        context.close().await;
        if let Err(err) = Barrier::new(context.repository().registry().clone())
            .signal(&job_id, STOPPED_MILESTONE, item)
            .await
        {
            warn!(job_id = %job_id, item, error = %err, "failed to signal stopped barrier");
        }

        running.decrement(1.0);
        info!(job_id = %job_id, item, "job item exited");

        result
    }

    /// Loads the persisted progress into the live one. Returns whether the item has work left.
    async fn resume(&self) -> MigrationResult<bool> {
        let context = &self.context;
        let Some(persisted) = context
            .repository()
            .load_progress(context.job_id(), context.item())
            .await?
        else {
            return Ok(true);
        };

        let status = persisted.status;
        context.progress().reload(persisted).await;

        match status {
            JobItemStatus::Finished => {
                info!(job_id = context.job_id(), item = context.item(), "job item already finished");
                Ok(false)
            }
            status if status.is_terminal() => bail!(
                ErrorKind::InvalidJobState,
                "Job item failed in a previous run and must be reset",
                format!("item {} is {status}", context.item())
            ),
            _ => Ok(true),
        }
    }

    /// Executes the item while its progress is written in the background.
    ///
    /// Only changes made by this run are written, so an item stopped before it did any work
    /// leaves its persisted progress untouched.
    async fn run_with_persister(&self) -> MigrationResult<()> {
        let context = &self.context;
        let (persister_tx, persister_rx) = create_shutdown_channel();
        let persister = ProgressPersister::new(
            context.job_id().to_string(),
            context.item(),
            context.progress().clone(),
            context.repository().clone(),
            self.checkpoint_interval,
        );
        let persister_handle = tokio::spawn(persister.run(persister_rx));

        let result = self.execute().await;
        if let Err(err) = &result {
            error!(job_id = context.job_id(), item = context.item(), error = %err, "job item failed");
            if let Err(refresh_err) = self.refresh_unprepared_progress().await {
                warn!(job_id = context.job_id(), item = context.item(), error = %refresh_err, "failed to refresh progress");
            }
            context.progress().record_error(err.to_string()).await;
        }

        persister_tx.shutdown();
        if let Err(err) = persister_handle.await {
            warn!(job_id = context.job_id(), item = context.item(), error = %err, "progress persister panicked");
        }

        result
    }

    /// Before its own preparation, another item may have marked this one prepared. Picks that
    /// up so recording a failure does not write the older status back.
    async fn refresh_unprepared_progress(&self) -> MigrationResult<()> {
        let context = &self.context;
        if !context.progress().status().await.needs_preparation() {
            return Ok(());
        }

        if let Some(persisted) = context
            .repository()
            .load_progress(context.job_id(), context.item())
            .await?
        {
            context.progress().reload(persisted).await;
        }

        Ok(())
    }

    async fn execute(&self) -> MigrationResult<()> {
        let context = &self.context;
        let prepared = with_retries(&self.retry, context.shutdown_rx(), "prepare", || {
            self.preparer.prepare(context)
        })
        .await?;
        let tasks = match prepared {
            ShutdownResult::Ok(ShutdownResult::Ok(tasks)) => tasks,
            _ => {
                info!(job_id = context.job_id(), item = context.item(), "job item stopped during preparation");
                return Ok(());
            }
        };

        let PreparedTasks {
            inventory,
            incremental,
            ..
        } = tasks;

        if !inventory.is_empty() {
            context
                .progress()
                .advance_status(JobItemStatus::ExecuteInventoryTask)
                .await?;

            if let Err(err) = self.run_inventory(inventory).await {
                context
                    .progress()
                    .fail(JobItemStatus::ExecuteInventoryTaskFailure, err.to_string())
                    .await?;
                return Err(err);
            }
            if context.is_stopping() {
                return Ok(());
            }
        }

        let Some(incremental) = incremental else {
            info!(job_id = context.job_id(), item = context.item(), "no change capture, job item finished");
            context.progress().advance_status(JobItemStatus::Finished).await?;
            return Ok(());
        };

        context
            .progress()
            .advance_status(JobItemStatus::ExecuteIncrementalTask)
            .await?;

        let span = info_span!("incremental_task", job_id = context.job_id(), item = context.item());
        if let Err(err) = incremental
            .run(context.shutdown_rx().clone())
            .instrument(span)
            .await
        {
            context
                .progress()
                .fail(JobItemStatus::ExecuteIncrementalTaskFailure, err.to_string())
                .await?;
            return Err(err);
        }

        Ok(())
    }

    /// Runs inventory tasks on at most `worker_threads` concurrent tasks.
    async fn run_inventory(&self, tasks: Vec<InventoryTask<D>>) -> MigrationResult<()> {
        let context = &self.context;
        let permits = Arc::new(Semaphore::new(
            context.job_config().process.worker_threads.max(1),
        ));
        let mut join_set = JoinSet::new();

        for task in tasks {
            let permits = permits.clone();
            let shutdown_rx = context.shutdown_rx().clone();
            let chunk_id = task.chunk().id.clone();
            let span = info_span!("inventory_task", job_id = context.job_id(), item = context.item(), chunk = %chunk_id);

            join_set.spawn(
                async move {
                    let _permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(err) => {
                            return (
                                chunk_id,
                                Err(migration_error!(
                                    ErrorKind::Unknown,
                                    "Inventory task permits were closed",
                                    source: err
                                )),
                            );
                        }
                    };

                    let result = task.run(shutdown_rx).await;
                    (chunk_id, result)
                }
                .instrument(span),
            );
        }

        let mut errors = Vec::new();
        let mut stopped = 0;
        let mut copied = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(InventoryTaskResult::Completed { copied: rows }))) => copied += rows,
                Ok((_, Ok(InventoryTaskResult::Stopped))) => stopped += 1,
                Ok((chunk_id, Err(err))) => {
                    error!(chunk = %chunk_id, error = %err, "inventory task failed");
                    errors.push(err);
                }
                Err(join_err) if join_err.is_cancelled() => {
                    debug!("inventory task was cancelled");
                }
                Err(join_err) => errors.push(migration_error!(
                    ErrorKind::TaskPanic,
                    "Inventory task panicked",
                    join_err
                )),
            }
        }

        if !errors.is_empty() {
            return Err(MigrationError::from(errors));
        }

        info!(
            job_id = context.job_id(),
            item = context.item(),
            copied,
            stopped,
            "inventory tasks finished"
        );

        Ok(())
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use config::shared::JobConfig;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::coordination::{JobRepository, LockService, Registry};
use crate::dialect::Dialect;
use crate::error::{ErrorKind, MigrationError, MigrationResult};
use crate::job::{JobItemContext, JobItemRunner};
use crate::migration_error;
use crate::preparer::JobPreparer;
use crate::progress::{ItemProgress, JobItemProgress};

#[derive(Debug)]
enum JobState {
    NotStarted,
    Started {
        join_set: JoinSet<(u32, MigrationResult<()>)>,
        items: BTreeMap<u32, Arc<ItemProgress>>,
    },
}

/// The sharding items of one job that run in this process.
///
/// Every item gets its own [`JobItemRunner`] task. All of them observe the same stop signal.
#[derive(Debug)]
pub struct Job<D, R, L> {
    job_id: String,
    config: Arc<JobConfig>,
    dialect: D,
    repository: JobRepository<R>,
    lock_service: L,
    state: JobState,
    shutdown_tx: ShutdownTx,
}

impl<D, R, L> Job<D, R, L>
where
    D: Dialect,
    R: Registry,
    L: LockService,
{
    pub fn new(
        job_id: String,
        config: JobConfig,
        dialect: D,
        repository: JobRepository<R>,
        lock_service: L,
    ) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            job_id,
            config: Arc::new(config),
            dialect,
            repository,
            lock_service,
            state: JobState::NotStarted,
            shutdown_tx,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Live progress of a started item.
    pub fn item_progress(&self, item: u32) -> Option<Arc<ItemProgress>> {
        match &self.state {
            JobState::Started { items, .. } => items.get(&item).cloned(),
            JobState::NotStarted => None,
        }
    }

    /// Starts `items`, or every item of the job when empty.
    pub async fn start(&mut self, items: &[u32]) -> MigrationResult<()> {
        if matches!(self.state, JobState::Started { .. }) {
            bail!(
                ErrorKind::InvalidJobState,
                "Job is already started",
                format!("job {}", self.job_id)
            );
        }

        let total = self.config.sharding_total_count;
        let items: Vec<u32> = if items.is_empty() {
            (0..total).collect()
        } else {
            items.to_vec()
        };
        if let Some(item) = items.iter().find(|item| **item >= total) {
            bail!(
                ErrorKind::ConfigError,
                "Sharding item is out of range",
                format!("item {item} of job {} with {total} items", self.job_id)
            );
        }

        info!(job_id = %self.job_id, ?items, "starting job");

        let process = &self.config.process;
        let preparer = JobPreparer::new(
            self.lock_service.clone(),
            Duration::from_millis(process.lock_timeout_ms),
            Duration::from_millis(process.connect_timeout_ms),
        );

        let mut join_set = JoinSet::new();
        let mut progress = BTreeMap::new();
        for item in items {
            let item_progress = ItemProgress::new(JobItemProgress::default());
            let context = Arc::new(JobItemContext::new(
                self.job_id.clone(),
                item,
                self.config.clone(),
                self.dialect.clone(),
                self.repository.clone(),
                item_progress.clone(),
                self.shutdown_tx.subscribe(),
            ));
            let runner = JobItemRunner::new(context, preparer.clone());
            let span = info_span!("job_item", job_id = %self.job_id, item);

            join_set.spawn(
                async move {
                    let result = runner.run().await;
                    (item, result)
                }
                .instrument(span),
            );
            progress.insert(item, item_progress);
        }

        self.state = JobState::Started {
            join_set,
            items: progress,
        };

        Ok(())
    }

    /// Waits for every started item. Errors of all items are aggregated.
    pub async fn wait(self) -> MigrationResult<()> {
        let JobState::Started { mut join_set, .. } = self.state else {
            info!(job_id = %self.job_id, "job was not started, nothing to wait for");
            return Ok(());
        };

        let mut errors = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((item, Ok(()))) => debug!(job_id = %self.job_id, item, "job item completed"),
                Ok((item, Err(err))) => {
                    error!(job_id = %self.job_id, item, error = %err, "job item completed with error");
                    errors.push(err);
                }
                Err(join_err) if join_err.is_cancelled() => {
                    debug!(job_id = %self.job_id, "job item task was cancelled");
                }
                Err(join_err) => errors.push(migration_error!(
                    ErrorKind::TaskPanic,
                    "Job item panicked",
                    join_err
                )),
            }
        }

        if !errors.is_empty() {
            return Err(MigrationError::from(errors));
        }

        info!(job_id = %self.job_id, "job completed");

        Ok(())
    }

    /// Asks every item to stop at its next checkpoint.
    pub fn stop(&self) {
        info!(job_id = %self.job_id, "stopping job");
        self.shutdown_tx.shutdown();
    }

    pub async fn shutdown_and_wait(self) -> MigrationResult<()> {
        self.stop();
        self.wait().await
    }
}

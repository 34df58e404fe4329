use std::sync::Arc;

use config::shared::JobConfig;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::coordination::{JobRepository, Registry};
use crate::dialect::{DataSource, Dialect};
use crate::error::MigrationResult;
use crate::progress::ItemProgress;

/// Runtime state of one sharding item, owned by the process running it.
///
/// Source and target handles are connected on first use and closed by [`JobItemContext::close`].
pub struct JobItemContext<D: Dialect, R> {
    job_id: String,
    item: u32,
    job_config: Arc<JobConfig>,
    dialect: D,
    repository: JobRepository<R>,
    progress: Arc<ItemProgress>,
    shutdown_rx: ShutdownRx,
    source: OnceCell<D::Source>,
    target: OnceCell<D::Target>,
}

impl<D: Dialect, R: Registry> JobItemContext<D, R> {
    pub fn new(
        job_id: String,
        item: u32,
        job_config: Arc<JobConfig>,
        dialect: D,
        repository: JobRepository<R>,
        progress: Arc<ItemProgress>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            job_id,
            item,
            job_config,
            dialect,
            repository,
            progress,
            shutdown_rx,
            source: OnceCell::new(),
            target: OnceCell::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn item(&self) -> u32 {
        self.item
    }

    pub fn job_config(&self) -> &JobConfig {
        &self.job_config
    }

    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    pub fn repository(&self) -> &JobRepository<R> {
        &self.repository
    }

    pub fn progress(&self) -> &Arc<ItemProgress> {
        &self.progress
    }

    pub fn shutdown_rx(&self) -> &ShutdownRx {
        &self.shutdown_rx
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown_rx.is_shutdown()
    }

    pub fn is_same_database(&self) -> bool {
        self.dialect
            .is_same_database(&self.job_config.source, &self.job_config.target)
    }

    pub async fn source(&self) -> MigrationResult<&D::Source> {
        self.source
            .get_or_try_init(|| self.dialect.connect_source(&self.job_config.source))
            .await
    }

    pub async fn target(&self) -> MigrationResult<&D::Target> {
        self.target
            .get_or_try_init(|| self.dialect.connect_target(&self.job_config.target))
            .await
    }

    /// Writes the current progress snapshot to the registry.
    pub async fn persist_progress(&self) -> MigrationResult<()> {
        let snapshot = self.progress.snapshot().await;
        self.repository
            .persist_progress(&self.job_id, self.item, &snapshot)
            .await
    }

    /// Closes the handles that were connected. Close errors are logged, not returned.
    pub async fn close(&self) {
        if let Some(source) = self.source.get()
            && let Err(err) = source.close().await
        {
            warn!(job_id = %self.job_id, item = self.item, error = %err, "failed to close source");
        }
        if let Some(target) = self.target.get()
            && let Err(err) = target.close().await
        {
            warn!(job_id = %self.job_id, item = self.item, error = %err, "failed to close target");
        }

        debug!(job_id = %self.job_id, item = self.item, "job item resources released");
    }
}

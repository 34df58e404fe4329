use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use config::shared::JobConfig;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bail;
use crate::check::{ConsistencyCheckResult, ConsistencyChecker, aggregate_check_results};
use crate::coordination::{
    Barrier, JobRepository, LockService, PREPARE_SUCCESS_MILESTONE, Registry, STOPPED_MILESTONE,
};
use crate::dialect::{ChangeFeed, DataSource, Dialect, PositionProvider};
use crate::error::{ErrorKind, MigrationResult};
use crate::job::{Job, JobInfo, generate_job_id};
use crate::migration_error;
use crate::preparer::load_table_task_config;
use crate::progress::{JobItemProgress, JobItemStatus};
use crate::types::TableName;

/// Default wait for every item of a job to reach the stopped barrier.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Control surface for creating, running, verifying and removing jobs.
///
/// Jobs started through one `JobApi` run in this process. Their documents live in the registry
/// so other processes can observe and stop them.
#[derive(Debug)]
pub struct JobApi<D, R, L> {
    dialect: D,
    repository: JobRepository<R>,
    lock_service: L,
    jobs: Arc<Mutex<HashMap<String, Job<D, R, L>>>>,
    stop_timeout: Duration,
}

impl<D: Clone, R: Clone, L: Clone> Clone for JobApi<D, R, L> {
    fn clone(&self) -> Self {
        Self {
            dialect: self.dialect.clone(),
            repository: self.repository.clone(),
            lock_service: self.lock_service.clone(),
            jobs: self.jobs.clone(),
            stop_timeout: self.stop_timeout,
        }
    }
}

impl<D, R, L> JobApi<D, R, L>
where
    D: Dialect,
    R: Registry,
    L: LockService,
{
    pub fn new(dialect: D, registry: R, lock_service: L) -> Self {
        Self {
            dialect,
            repository: JobRepository::new(registry),
            lock_service,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn repository(&self) -> &JobRepository<R> {
        &self.repository
    }

    /// Validates and persists a new job. Returns its id.
    pub async fn create_job(&self, mut config: JobConfig) -> MigrationResult<String> {
        config.validate().map_err(|err| {
            migration_error!(ErrorKind::ConfigError, "Job configuration is invalid", err)
        })?;

        let job_id = match config.job_id.clone() {
            Some(job_id) => job_id,
            None => generate_job_id(&config),
        };
        if self.repository.load_info(&job_id).await?.is_some() {
            bail!(
                ErrorKind::DuplicateJobId,
                "A job with this id already exists",
                format!("job {job_id}")
            );
        }

        config.job_id = Some(job_id.clone());
        self.repository.persist_config(&job_id, &config).await?;
        self.repository
            .persist_info(&JobInfo::new(job_id.clone(), &config))
            .await?;

        info!(job_id = %job_id, tables = config.tables.len(), "job created");

        Ok(job_id)
    }

    /// Runs `items` of the job in this process, or all of its items when empty.
    pub async fn start_job(&self, job_id: &str, items: &[u32]) -> MigrationResult<()> {
        let config = self.load_config(job_id).await?;
        let mut info = self.load_info(job_id).await?;

        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(job_id) {
            bail!(
                ErrorKind::InvalidJobState,
                "Job is already running in this process",
                format!("job {job_id}")
            );
        }

        Barrier::new(self.repository.registry().clone())
            .clear(job_id, STOPPED_MILESTONE)
            .await?;

        let mut job = Job::new(
            job_id.to_string(),
            config,
            self.dialect.clone(),
            self.repository.clone(),
            self.lock_service.clone(),
        );
        job.start(items).await?;
        jobs.insert(job_id.to_string(), job);

        info.active = true;
        info.stop_time = None;
        self.repository.persist_info(&info).await?;

        Ok(())
    }

    /// Stops the items running here and waits until every item of the job has exited.
    pub async fn stop_job(&self, job_id: &str) -> MigrationResult<()> {
        let mut info = self.load_info(job_id).await?;

        let job = self.jobs.lock().await.remove(job_id);
        if let Some(job) = job
            && let Err(err) = job.shutdown_and_wait().await
        {
            warn!(job_id = %job_id, error = %err, "job stopped with errors");
        }

        if info.active {
            let stopped = Barrier::new(self.repository.registry().clone())
                .await_all(
                    job_id,
                    STOPPED_MILESTONE,
                    info.sharding_total_count,
                    self.stop_timeout,
                )
                .await?;
            if !stopped {
                warn!(job_id = %job_id, timeout = ?self.stop_timeout, "not every job item reported stopped");
            }
        }

        info.active = false;
        info.stop_time = Some(Utc::now());
        self.repository.persist_info(&info).await?;

        info!(job_id = %job_id, "job stopped");

        Ok(())
    }

    /// Stops the job, releases its change streams and deletes every document it owns.
    pub async fn drop_job(&self, job_id: &str) -> MigrationResult<()> {
        let config = self.load_config(job_id).await?;
        self.stop_job(job_id).await?;

        if let Err(err) = self.release_change_feeds(job_id, &config).await {
            warn!(job_id = %job_id, error = %err, "failed to release change streams");
        }
        self.repository.delete_job(job_id).await?;

        info!(job_id = %job_id, "job dropped");

        Ok(())
    }

    pub async fn list_jobs(&self) -> MigrationResult<Vec<JobInfo>> {
        let mut jobs = Vec::new();
        for job_id in self.repository.job_ids().await? {
            if let Some(info) = self.repository.load_info(&job_id).await? {
                jobs.push(info);
            }
        }

        Ok(jobs)
    }

    /// Progress of every item, live for items running here and persisted for the rest.
    pub async fn job_progress(
        &self,
        job_id: &str,
    ) -> MigrationResult<BTreeMap<u32, JobItemProgress>> {
        let config = self.load_config(job_id).await?;
        let mut progress = self.repository.load_all_progress(job_id).await?;

        let jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get(job_id) {
            for item in 0..config.sharding_total_count {
                if let Some(live) = job.item_progress(item) {
                    progress.insert(item, live.snapshot().await);
                }
            }
        }

        Ok(progress)
    }

    /// Whether every item of the job is finished.
    pub async fn is_job_completed(&self, job_id: &str) -> MigrationResult<bool> {
        let config = self.load_config(job_id).await?;
        let progress = self.job_progress(job_id).await?;

        Ok(progress.len() == config.sharding_total_count as usize
            && progress
                .values()
                .all(|item| item.status == JobItemStatus::Finished))
    }

    /// Compares every table of the job and persists the results.
    pub async fn check(&self, job_id: &str) -> MigrationResult<Vec<ConsistencyCheckResult>> {
        let config = self.load_config(job_id).await?;
        let source = self.dialect.connect_source(&config.source).await?;
        let target = self.dialect.connect_source(&config.target).await?;
        let checker = ConsistencyChecker::new(config.process.batch_size);

        let mut results = Vec::with_capacity(config.tables.len());
        let mut outcome = Ok(());
        for mapping in &config.tables {
            let table = match load_table_task_config(&source, mapping).await {
                Ok(table) => table,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            };
            match checker.check_table(&source, &target, &table).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        for handle in [&source, &target] {
            if let Err(err) = handle.close().await {
                warn!(job_id = %job_id, error = %err, "failed to close check connection");
            }
        }
        outcome?;

        self.repository.persist_check_results(job_id, &results).await?;
        info!(
            job_id = %job_id,
            passed = aggregate_check_results(&results),
            tables = results.len(),
            "consistency check finished"
        );

        Ok(results)
    }

    pub async fn check_result(
        &self,
        job_id: &str,
    ) -> MigrationResult<Option<Vec<ConsistencyCheckResult>>> {
        self.repository.load_check_results(job_id).await
    }

    /// Finishes a job whose last consistency check passed once every item was prepared.
    pub async fn commit_job(&self, job_id: &str) -> MigrationResult<()> {
        let config = self.load_config(job_id).await?;
        let results = self
            .repository
            .load_check_results(job_id)
            .await?
            .unwrap_or_default();
        if !aggregate_check_results(&results) {
            bail!(
                ErrorKind::ConsistencyCheckNotPassed,
                "Job cannot be committed before a passing consistency check",
                format!("job {job_id}")
            );
        }

        let prepared = Barrier::new(self.repository.registry().clone())
            .count(job_id, PREPARE_SUCCESS_MILESTONE)
            .await?;
        if prepared < config.sharding_total_count as usize {
            bail!(
                ErrorKind::InvalidJobState,
                "Job cannot be committed before every item is prepared",
                format!(
                    "{prepared} of {} items of job {job_id} prepared",
                    config.sharding_total_count
                )
            );
        }

        self.stop_job(job_id).await?;

        for item in 0..config.sharding_total_count {
            let mut progress = self
                .repository
                .load_progress(job_id, item)
                .await?
                .unwrap_or_default();
            progress.set_status(JobItemStatus::Finished)?;
            self.repository
                .persist_progress(job_id, item, &progress)
                .await?;
        }

        info!(job_id = %job_id, "job committed");

        Ok(())
    }

    /// Clears progress and check results of a stopped job so its next start prepares again.
    ///
    /// Rows already written to the target are left in place.
    pub async fn reset_job(&self, job_id: &str) -> MigrationResult<()> {
        let info = self.load_info(job_id).await?;
        if info.active || self.jobs.lock().await.contains_key(job_id) {
            bail!(
                ErrorKind::InvalidJobState,
                "Only a stopped job can be reset",
                format!("job {job_id}")
            );
        }

        self.repository.delete_progress(job_id).await?;
        self.repository.delete_check_results(job_id).await?;
        Barrier::new(self.repository.registry().clone())
            .clear(job_id, PREPARE_SUCCESS_MILESTONE)
            .await?;

        info!(job_id = %job_id, "job reset");

        Ok(())
    }

    async fn release_change_feeds(&self, job_id: &str, config: &JobConfig) -> MigrationResult<()> {
        let source = self.dialect.connect_source(&config.source).await?;
        if source.supports_change_capture() {
            for item in 0..config.sharding_total_count {
                let tables = config
                    .tables_for_item(item)
                    .into_iter()
                    .map(|mapping| TableName::parse(&mapping.source_table))
                    .collect();
                source.release(&ChangeFeed::new(job_id, item, tables)).await?;
            }
        }

        source.close().await
    }

    async fn load_config(&self, job_id: &str) -> MigrationResult<JobConfig> {
        self.repository
            .load_config(job_id)
            .await?
            .ok_or_else(|| job_not_found(job_id))
    }

    async fn load_info(&self, job_id: &str) -> MigrationResult<JobInfo> {
        self.repository
            .load_info(job_id)
            .await?
            .ok_or_else(|| job_not_found(job_id))
    }
}

fn job_not_found(job_id: &str) -> crate::error::MigrationError {
    migration_error!(
        ErrorKind::JobNotFound,
        "Job does not exist",
        format!("job {job_id}")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{MemoryLockService, MemoryRegistry};
    use crate::dialect::memory::MemoryDialect;
    use crate::test_utils::job::job_config;

    fn api() -> JobApi<MemoryDialect, MemoryRegistry, MemoryLockService> {
        JobApi::new(
            MemoryDialect::new(),
            MemoryRegistry::new(),
            MemoryLockService::new(),
        )
    }

    #[tokio::test]
    async fn duplicate_jobs_are_rejected() {
        let api = api();

        let job_id = api.create_job(job_config(1)).await.unwrap();
        let err = api.create_job(job_config(1)).await.unwrap_err();

        assert!(job_id.starts_with("j01"));
        assert_eq!(err.kind(), ErrorKind::DuplicateJobId);
        assert_eq!(api.list_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_configs_are_rejected() {
        let err = api().create_job(job_config(0)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn unknown_jobs_are_reported() {
        let err = api().stop_job("j01missing").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::JobNotFound);
    }

    #[tokio::test]
    async fn commit_requires_a_passing_check() {
        let api = api();
        let job_id = api.create_job(job_config(1)).await.unwrap();

        let err = api.commit_job(&job_id).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConsistencyCheckNotPassed);
    }

    #[tokio::test]
    async fn commit_waits_for_every_item_to_be_prepared() {
        let api = api();
        let job_id = api.create_job(job_config(2)).await.unwrap();
        let passed = ConsistencyCheckResult {
            table: "t_order".to_string(),
            matched: true,
            source_records: 3,
            target_records: 3,
            first_mismatch: None,
            ignored: false,
        };
        api.repository()
            .persist_check_results(&job_id, &[passed])
            .await
            .unwrap();
        let barrier = Barrier::new(api.repository().registry().clone());
        barrier
            .signal(&job_id, PREPARE_SUCCESS_MILESTONE, 0)
            .await
            .unwrap();

        let err = api.commit_job(&job_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidJobState);

        barrier
            .signal(&job_id, PREPARE_SUCCESS_MILESTONE, 1)
            .await
            .unwrap();
        api.commit_job(&job_id).await.unwrap();

        assert!(api.is_job_completed(&job_id).await.unwrap());
    }

    #[tokio::test]
    async fn reset_clears_progress_of_a_stopped_job() {
        let api = api();
        let job_id = api.create_job(job_config(1)).await.unwrap();
        api.repository()
            .persist_progress(
                &job_id,
                0,
                &JobItemProgress::with_status(JobItemStatus::ExecuteInventoryTaskFailure),
            )
            .await
            .unwrap();

        let barrier = Barrier::new(api.repository().registry().clone());
        barrier
            .signal(&job_id, PREPARE_SUCCESS_MILESTONE, 0)
            .await
            .unwrap();

        api.reset_job(&job_id).await.unwrap();

        assert!(api.job_progress(&job_id).await.unwrap().is_empty());
        assert_eq!(
            barrier.count(&job_id, PREPARE_SUCCESS_MILESTONE).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn reset_requires_an_inactive_job() {
        let api = api();
        let job_id = api.create_job(job_config(1)).await.unwrap();
        let mut info = api.repository().load_info(&job_id).await.unwrap().unwrap();
        info.active = true;
        api.repository().persist_info(&info).await.unwrap();

        let err = api.reset_job(&job_id).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidJobState);
    }
}

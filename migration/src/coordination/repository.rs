use std::collections::BTreeMap;

use config::shared::JobConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::check::ConsistencyCheckResult;
use crate::coordination::{Registry, keys};
use crate::error::{ErrorKind, MigrationResult};
use crate::job::JobInfo;
use crate::migration_error;
use crate::progress::JobItemProgress;

/// Typed access to the job documents stored in a [`Registry`].
#[derive(Debug, Clone)]
pub struct JobRepository<R> {
    registry: R,
}

impl<R: Registry> JobRepository<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> MigrationResult<()> {
        let json = serde_json::to_string(value).map_err(|err| {
            migration_error!(
                ErrorKind::SerializationError,
                "Could not serialize registry document",
                format!("{key}: {err}")
            )
        })?;

        self.registry.put(key, json).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> MigrationResult<Option<T>> {
        let Some(json) = self.registry.get(key).await? else {
            return Ok(None);
        };

        serde_json::from_str(&json).map(Some).map_err(|err| {
            migration_error!(
                ErrorKind::DeserializationError,
                "Could not deserialize registry document",
                format!("{key}: {err}")
            )
        })
    }

    pub async fn persist_config(&self, job_id: &str, config: &JobConfig) -> MigrationResult<()> {
        self.put_json(&keys::job_config(job_id), config).await
    }

    pub async fn load_config(&self, job_id: &str) -> MigrationResult<Option<JobConfig>> {
        self.get_json(&keys::job_config(job_id)).await
    }

    pub async fn persist_info(&self, info: &JobInfo) -> MigrationResult<()> {
        self.put_json(&keys::job_info(&info.job_id), info).await
    }

    pub async fn load_info(&self, job_id: &str) -> MigrationResult<Option<JobInfo>> {
        self.get_json(&keys::job_info(job_id)).await
    }

    pub async fn job_ids(&self) -> MigrationResult<Vec<String>> {
        self.registry.children(keys::jobs_root()).await
    }

    pub async fn persist_progress(
        &self,
        job_id: &str,
        item: u32,
        progress: &JobItemProgress,
    ) -> MigrationResult<()> {
        self.put_json(&keys::job_offset(job_id, item), progress).await
    }

    pub async fn load_progress(
        &self,
        job_id: &str,
        item: u32,
    ) -> MigrationResult<Option<JobItemProgress>> {
        self.get_json(&keys::job_offset(job_id, item)).await
    }

    /// Returns the progress of every item that has one.
    pub async fn load_all_progress(
        &self,
        job_id: &str,
    ) -> MigrationResult<BTreeMap<u32, JobItemProgress>> {
        let mut all = BTreeMap::new();
        for child in self.registry.children(&keys::job_offsets(job_id)).await? {
            let Ok(item) = child.parse::<u32>() else {
                continue;
            };
            if let Some(progress) = self.load_progress(job_id, item).await? {
                all.insert(item, progress);
            }
        }

        Ok(all)
    }

    pub async fn delete_progress(&self, job_id: &str) -> MigrationResult<()> {
        self.registry.delete_tree(&keys::job_offsets(job_id)).await
    }

    pub async fn persist_check_results(
        &self,
        job_id: &str,
        results: &[ConsistencyCheckResult],
    ) -> MigrationResult<()> {
        self.put_json(&keys::check_result(job_id), &results).await
    }

    pub async fn load_check_results(
        &self,
        job_id: &str,
    ) -> MigrationResult<Option<Vec<ConsistencyCheckResult>>> {
        self.get_json(&keys::check_result(job_id)).await
    }

    pub async fn delete_check_results(&self, job_id: &str) -> MigrationResult<()> {
        self.registry.delete_tree(&keys::check_root(job_id)).await
    }

    /// Deletes every document of the job, including progress.
    pub async fn delete_job(&self, job_id: &str) -> MigrationResult<()> {
        self.registry.delete_tree(&keys::job_root(job_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryRegistry;
    use crate::progress::JobItemStatus;

    #[tokio::test]
    async fn progress_is_last_write_wins_per_item() {
        let repository = JobRepository::new(MemoryRegistry::new());
        repository
            .persist_progress("j1", 0, &JobItemProgress::with_status(JobItemStatus::Preparing))
            .await
            .unwrap();
        repository
            .persist_progress(
                "j1",
                0,
                &JobItemProgress::with_status(JobItemStatus::PrepareSuccess),
            )
            .await
            .unwrap();
        repository
            .persist_progress("j1", 1, &JobItemProgress::default())
            .await
            .unwrap();

        let all = repository.load_all_progress("j1").await.unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(all[&0].status, JobItemStatus::PrepareSuccess);
        assert_eq!(all[&1].status, JobItemStatus::Running);
    }

    #[tokio::test]
    async fn deleting_a_job_removes_its_whole_subtree() {
        let registry = MemoryRegistry::new();
        let repository = JobRepository::new(registry.clone());
        repository
            .persist_progress("j1", 0, &JobItemProgress::default())
            .await
            .unwrap();
        repository
            .persist_progress("j2", 0, &JobItemProgress::default())
            .await
            .unwrap();

        repository.delete_job("j1").await.unwrap();

        assert_eq!(repository.job_ids().await.unwrap(), vec!["j2".to_string()]);
        assert!(repository.load_progress("j1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_documents_are_reported() {
        let registry = MemoryRegistry::new();
        registry
            .put(&keys::job_offset("j1", 0), "{".to_string())
            .await
            .unwrap();
        let repository = JobRepository::new(registry);

        let err = repository.load_progress("j1", 0).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }
}

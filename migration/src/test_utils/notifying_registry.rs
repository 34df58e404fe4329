use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::coordination::{MemoryRegistry, Registry, keys};
use crate::error::MigrationResult;
use crate::progress::{JobItemProgress, JobItemStatus};
use crate::test_utils::notify::TimedNotify;

type StatusCondition = (String, u32, JobItemStatus, Arc<Notify>);

/// A [`MemoryRegistry`] that notifies waiters when a job item persists a given status.
#[derive(Debug, Clone, Default)]
pub struct NotifyingRegistry {
    inner: MemoryRegistry,
    conditions: Arc<Mutex<Vec<StatusCondition>>>,
}

impl NotifyingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryRegistry {
        &self.inner
    }

    /// Returns a notification fired once `item` of `job_id` persists `status`.
    ///
    /// Fires immediately when the persisted progress already has that status.
    pub async fn notify_on_item_status(
        &self,
        job_id: &str,
        item: u32,
        status: JobItemStatus,
    ) -> TimedNotify {
        let notify = Arc::new(Notify::new());
        let mut conditions = self.conditions.lock().await;

        let current = self
            .inner
            .get(&keys::job_offset(job_id, item))
            .await
            .ok()
            .flatten()
            .and_then(|json| serde_json::from_str::<JobItemProgress>(&json).ok());
        if current.is_some_and(|progress| progress.status == status) {
            notify.notify_one();
        } else {
            conditions.push((job_id.to_string(), item, status, notify.clone()));
        }

        TimedNotify::new(notify)
    }

    async fn check_conditions(&self, key: &str, value: &str) {
        let Ok(progress) = serde_json::from_str::<JobItemProgress>(value) else {
            return;
        };

        self.conditions
            .lock()
            .await
            .retain(|(job_id, item, status, notify)| {
                let matched = key == keys::job_offset(job_id, *item) && progress.status == *status;
                if matched {
                    notify.notify_one();
                }
                !matched
            });
    }
}

impl Registry for NotifyingRegistry {
    async fn put(&self, key: &str, value: String) -> MigrationResult<()> {
        self.inner.put(key, value.clone()).await?;
        self.check_conditions(key, &value).await;

        Ok(())
    }

    async fn get(&self, key: &str) -> MigrationResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn delete_tree(&self, prefix: &str) -> MigrationResult<()> {
        self.inner.delete_tree(prefix).await
    }

    async fn children(&self, prefix: &str) -> MigrationResult<Vec<String>> {
        self.inner.children(prefix).await
    }
}

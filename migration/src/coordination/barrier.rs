use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::coordination::{Registry, keys};
use crate::error::MigrationResult;

/// Every item finished preparing.
pub const PREPARE_SUCCESS_MILESTONE: &str = "prepare_success";

/// Every item stopped its tasks.
pub const STOPPED_MILESTONE: &str = "stopped";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Rendezvous of the sharding items of a job, stored in the registry.
#[derive(Debug, Clone)]
pub struct Barrier<R> {
    registry: R,
}

impl<R: Registry> Barrier<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    /// Records that `item` reached `milestone`.
    pub async fn signal(&self, job_id: &str, milestone: &str, item: u32) -> MigrationResult<()> {
        debug!(job_id, milestone, item, "barrier signaled");
        self.registry
            .put(
                &keys::barrier_item(job_id, milestone, item),
                Utc::now().to_rfc3339(),
            )
            .await
    }

    /// Number of items that reached `milestone`.
    pub async fn count(&self, job_id: &str, milestone: &str) -> MigrationResult<usize> {
        Ok(self
            .registry
            .children(&keys::barrier(job_id, milestone))
            .await?
            .len())
    }

    /// Waits until `total` items reached `milestone`. Returns `false` on timeout.
    pub async fn await_all(
        &self,
        job_id: &str,
        milestone: &str,
        total: u32,
        timeout: Duration,
    ) -> MigrationResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count(job_id, milestone).await? >= total as usize {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Removes every signal of `milestone`.
    pub async fn clear(&self, job_id: &str, milestone: &str) -> MigrationResult<()> {
        self.registry
            .delete_tree(&keys::barrier(job_id, milestone))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryRegistry;

    #[tokio::test]
    async fn await_all_completes_once_every_item_signaled() {
        let barrier = Barrier::new(MemoryRegistry::new());
        barrier.signal("j1", STOPPED_MILESTONE, 0).await.unwrap();

        let waiting = {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier
                    .await_all("j1", STOPPED_MILESTONE, 2, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        barrier.signal("j1", STOPPED_MILESTONE, 1).await.unwrap();

        assert!(waiting.await.unwrap());
    }

    #[tokio::test]
    async fn await_all_times_out_and_clear_resets() {
        let barrier = Barrier::new(MemoryRegistry::new());
        barrier.signal("j1", PREPARE_SUCCESS_MILESTONE, 0).await.unwrap();
        barrier.signal("j1", PREPARE_SUCCESS_MILESTONE, 0).await.unwrap();

        let all = barrier
            .await_all("j1", PREPARE_SUCCESS_MILESTONE, 2, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!all);

        barrier.clear("j1", PREPARE_SUCCESS_MILESTONE).await.unwrap();
        assert_eq!(barrier.count("j1", PREPARE_SUCCESS_MILESTONE).await.unwrap(), 0);
    }
}

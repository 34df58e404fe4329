use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::coordination::{JobRepository, Registry};
use crate::progress::ItemProgress;

/// Writes the progress of one job item to the registry in the background.
///
/// The first update after a write is persisted right away, later ones at most once per
/// interval. Pending updates are flushed when the persister is stopped. Progress that did not
/// change since it was loaded is never written.
#[derive(Debug)]
pub struct ProgressPersister<R> {
    job_id: String,
    item: u32,
    progress: Arc<ItemProgress>,
    repository: JobRepository<R>,
    interval: Duration,
}

impl<R: Registry> ProgressPersister<R> {
    pub fn new(
        job_id: String,
        item: u32,
        progress: Arc<ItemProgress>,
        repository: JobRepository<R>,
        interval: Duration,
    ) -> Self {
        Self {
            job_id,
            item,
            progress,
            repository,
            interval,
        }
    }

    pub async fn run(self, mut shutdown_rx: ShutdownRx) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.wait() => break,
                _ = self.progress.changed() => {}
            }
            self.persist_if_dirty().await;

            tokio::select! {
                biased;
                _ = shutdown_rx.wait() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.persist_if_dirty().await;
        }

        self.persist_if_dirty().await;
        debug!(job_id = %self.job_id, item = self.item, "progress persister stopped");
    }

    async fn persist_if_dirty(&self) {
        if !self.progress.take_dirty() {
            return;
        }

        let snapshot = self.progress.snapshot().await;
        if let Err(err) = self
            .repository
            .persist_progress(&self.job_id, self.item, &snapshot)
            .await
        {
            warn!(job_id = %self.job_id, item = self.item, error = %err, "failed to persist progress");
            self.progress.mark_dirty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::coordination::MemoryRegistry;
    use crate::progress::JobItemProgress;

    #[tokio::test]
    async fn updates_are_persisted_and_flushed_on_stop() {
        let repository = JobRepository::new(MemoryRegistry::new());
        let progress = ItemProgress::new(JobItemProgress::default());
        let persister = ProgressPersister::new(
            "j1".to_string(),
            2,
            progress.clone(),
            repository.clone(),
            Duration::from_millis(10),
        );
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let handle = tokio::spawn(persister.run(shutdown_rx));

        progress.add_processed(3);
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let persisted = repository.load_progress("j1", 2).await.unwrap();
                if persisted.is_some_and(|p| p.processed_records_count == 3) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        progress.add_processed(4);
        shutdown_tx.shutdown();
        handle.await.unwrap();

        let persisted = repository.load_progress("j1", 2).await.unwrap().unwrap();
        assert_eq!(persisted.processed_records_count, 7);
    }

    #[tokio::test]
    async fn unchanged_progress_is_never_written() {
        let repository = JobRepository::new(MemoryRegistry::new());
        let persister = ProgressPersister::new(
            "j1".to_string(),
            0,
            ItemProgress::new(JobItemProgress::default()),
            repository.clone(),
            Duration::from_millis(10),
        );
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let handle = tokio::spawn(persister.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.shutdown();
        handle.await.unwrap();

        assert!(repository.load_progress("j1", 0).await.unwrap().is_none());
    }
}

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use config::shared::RetryConfig;
use futures::{Stream, StreamExt, stream};
use metrics::counter;
use tokio::pin;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::concurrency::stream::{BatchLimits, BatchStream};
use crate::dialect::{ChangeEvent, ChangeFeed, Dialect, Importer, PositionProvider};
use crate::error::{ErrorKind, MigrationResult};
use crate::metrics::{ITEM_LABEL, JOB_ID_LABEL, MIGRATION_INCREMENTAL_RECORDS_TOTAL};
use crate::position::IncrementalPosition;
use crate::progress::ItemProgress;
use crate::task::retry::with_retries;
use crate::task::{ImporterConfig, IncrementalTaskConfig, TableTaskConfig};
use crate::types::{DataRecord, TableName};

/// Lifecycle of an [`IncrementalTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementalTaskState {
    NotStarted,
    Streaming,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for IncrementalTaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            IncrementalTaskState::NotStarted => "not_started",
            IncrementalTaskState::Streaming => "streaming",
            IncrementalTaskState::Stopping => "stopping",
            IncrementalTaskState::Stopped => "stopped",
            IncrementalTaskState::Failed => "failed",
        };

        f.write_str(state)
    }
}

/// Tails the change stream of the source and applies it to the target.
///
/// Events of one row are always applied in source order. Events of different rows are spread
/// over `write_concurrency` lanes that are written concurrently.
pub struct IncrementalTask<D: Dialect> {
    job_id: String,
    item: u32,
    source: D::Source,
    target: D::Target,
    feed: ChangeFeed,
    tables: Vec<Arc<TableTaskConfig>>,
    config: IncrementalTaskConfig,
    importer: ImporterConfig,
    start_position: Option<IncrementalPosition>,
    progress: Arc<ItemProgress>,
    state_tx: watch::Sender<IncrementalTaskState>,
}

impl<D: Dialect> IncrementalTask<D> {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        job_id: String,
        item: u32,
        source: D::Source,
        target: D::Target,
        feed: ChangeFeed,
        tables: Vec<Arc<TableTaskConfig>>,
        config: IncrementalTaskConfig,
        importer: ImporterConfig,
        start_position: Option<IncrementalPosition>,
        progress: Arc<ItemProgress>,
    ) -> Self {
        let (state_tx, _) = watch::channel(IncrementalTaskState::NotStarted);

        Self {
            job_id,
            item,
            source,
            target,
            feed,
            tables,
            config,
            importer,
            start_position,
            progress,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<IncrementalTaskState> {
        self.state_tx.subscribe()
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub async fn run(self, shutdown_rx: ShutdownRx) -> MigrationResult<()> {
        let result = self.stream_changes(shutdown_rx).await;
        match &result {
            Ok(()) => {
                self.state_tx.send_replace(IncrementalTaskState::Stopped);
            }
            Err(err) => {
                error!(job_id = %self.job_id, item = self.item, error = %err, "incremental task failed");
                self.state_tx.send_replace(IncrementalTaskState::Failed);
            }
        }

        result
    }

    async fn stream_changes(&self, shutdown_rx: ShutdownRx) -> MigrationResult<()> {
        // A persisted checkpoint is never behind the position captured at prepare time.
        let start = match self.progress.incremental_position().await {
            Some(position) => position,
            None => match self.start_position {
                Some(position) => position,
                None => bail!(
                    ErrorKind::PositionAcquisitionFailed,
                    "No incremental start position was recorded",
                    format!("feed `{}`", self.feed.name)
                ),
            },
        };

        info!(
            job_id = %self.job_id,
            item = self.item,
            feed = %self.feed.name,
            %start,
            "starting incremental task"
        );
        self.state_tx.send_replace(IncrementalTaskState::Streaming);

        let changes = change_stream(
            self.source.clone(),
            self.feed.clone(),
            start,
            self.config.max_batch_size,
            self.config.poll_interval,
            self.importer.retry.clone(),
            shutdown_rx.clone(),
        );
        let batches = BatchStream::wrap(
            changes,
            BatchLimits {
                max_size: self.config.max_batch_size,
                max_fill: self.config.max_fill,
            },
            &shutdown_rx,
        );
        pin!(batches);

        let mut checkpoint = start;
        while let Some(batch) = batches.next().await {
            let events = match batch {
                ShutdownResult::Ok(events) => events.into_iter().collect::<MigrationResult<Vec<_>>>()?,
                ShutdownResult::Shutdown(unapplied) => {
                    self.state_tx.send_replace(IncrementalTaskState::Stopping);
                    info!(
                        feed = %self.feed.name,
                        unapplied = unapplied.len(),
                        %checkpoint,
                        "incremental task stopping"
                    );
                    break;
                }
            };

            let mut fresh = Vec::with_capacity(events.len());
            for event in events {
                if !event.position.is_covered_by(&checkpoint)? {
                    fresh.push(event);
                }
            }
            let Some(last) = fresh.last() else {
                continue;
            };
            let position = last.position;
            let latest_event_at = fresh.iter().rev().find_map(|event| event.committed_at);

            let applied = fresh.len() as u64;
            let lanes = self.partition(fresh);
            if self.apply_lanes(&lanes, &shutdown_rx).await?.should_shutdown() {
                self.state_tx.send_replace(IncrementalTaskState::Stopping);
                break;
            }

            checkpoint = position;
            self.record_applied(position, latest_event_at, applied).await;

            if let Err(err) = self.source.acknowledge(&self.feed, position).await {
                warn!(feed = %self.feed.name, %position, error = %err, "failed to acknowledge position");
            }
        }

        info!(feed = %self.feed.name, %checkpoint, "incremental task stopped");

        Ok(())
    }

    /// Splits events into ordered lanes by row identity.
    fn partition(&self, events: Vec<ChangeEvent>) -> Vec<Vec<DataRecord>> {
        let lane_count = self.importer.write_concurrency.max(1);
        let mut lanes = vec![Vec::new(); lane_count];

        for event in events {
            let Some(target) = self.target_of(&event.record) else {
                debug!(table = %event.record.table, "skipping change of unmapped table");
                continue;
            };
            let record = event.record.with_table(target);
            let lane = (record.row_hash() % lane_count as u64) as usize;
            lanes[lane].push(record);
        }

        lanes
    }

    fn target_of(&self, record: &DataRecord) -> Option<TableName> {
        self.tables
            .iter()
            .find(|table| table.source_table == record.table)
            .map(|table| table.target_table.clone())
    }

    async fn apply_lanes(
        &self,
        lanes: &[Vec<DataRecord>],
        shutdown_rx: &ShutdownRx,
    ) -> MigrationResult<ShutdownResult<(), ()>> {
        let writes = lanes.iter().filter(|lane| !lane.is_empty()).map(|lane| {
            let target = &self.target;
            with_retries(&self.importer.retry, shutdown_rx, "incremental write", move || async move {
                target.write(lane).await
            })
        });

        let results = futures::future::try_join_all(writes).await?;
        if results.iter().any(ShutdownResult::should_shutdown) {
            return Ok(ShutdownResult::Shutdown(()));
        }

        Ok(ShutdownResult::Ok(()))
    }

    async fn record_applied(
        &self,
        position: IncrementalPosition,
        latest_event_at: Option<DateTime<Utc>>,
        applied: u64,
    ) {
        self.progress
            .set_incremental_position(position, latest_event_at)
            .await;
        self.progress.add_processed(applied);

        counter!(
            MIGRATION_INCREMENTAL_RECORDS_TOTAL,
            JOB_ID_LABEL => self.job_id.clone(),
            ITEM_LABEL => self.item.to_string(),
        )
        .increment(applied);
    }
}

struct PollState<S> {
    source: S,
    feed: ChangeFeed,
    after: IncrementalPosition,
    buffer: VecDeque<ChangeEvent>,
}

/// Endless stream of change events after `start`, polled from the source.
///
/// Empty polls sleep for `poll_interval`. The stream ends when a stop request interrupts a
/// retried poll, and yields an error once retries are exhausted.
fn change_stream<S>(
    source: S,
    feed: ChangeFeed,
    start: IncrementalPosition,
    limit: usize,
    poll_interval: Duration,
    retry: RetryConfig,
    shutdown_rx: ShutdownRx,
) -> impl Stream<Item = MigrationResult<ChangeEvent>>
where
    S: PositionProvider + Clone + Send + Sync + 'static,
{
    let state = PollState {
        source,
        feed,
        after: start,
        buffer: VecDeque::new(),
    };

    stream::unfold(Some(state), move |state| {
        let retry = retry.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            let mut state = state?;
            loop {
                if let Some(event) = state.buffer.pop_front() {
                    state.after = event.position;
                    return Some((Ok(event), Some(state)));
                }

                let source = &state.source;
                let feed = &state.feed;
                let after = state.after;
                let polled = with_retries(&retry, &shutdown_rx, "incremental poll", || async move {
                    source.poll_changes(feed, after, limit).await
                })
                .await;

                match polled {
                    Ok(ShutdownResult::Ok(events)) if events.is_empty() => {
                        tokio::time::sleep(poll_interval).await;
                    }
                    Ok(ShutdownResult::Ok(events)) => state.buffer.extend(events),
                    Ok(ShutdownResult::Shutdown(())) => return None,
                    Err(err) => return Some((Err(err), None)),
                }
            }
        }
    })
}

//! Persisted job item state and the live counters behind it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::bail;
use crate::error::{ErrorKind, MigrationResult};
use crate::position::{IncrementalPosition, InventoryPosition};

/// Lifecycle status of a sharding item.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobItemStatus {
    #[default]
    Running,
    Preparing,
    PreparingFailure,
    PrepareSuccess,
    ExecuteInventoryTask,
    ExecuteIncrementalTask,
    Finished,
    ExecuteInventoryTaskFailure,
    ExecuteIncrementalTaskFailure,
}

impl JobItemStatus {
    fn rank(&self) -> u8 {
        match self {
            JobItemStatus::Running => 0,
            JobItemStatus::Preparing => 1,
            JobItemStatus::PreparingFailure => 2,
            JobItemStatus::PrepareSuccess => 3,
            JobItemStatus::ExecuteInventoryTask | JobItemStatus::ExecuteInventoryTaskFailure => 4,
            JobItemStatus::ExecuteIncrementalTask
            | JobItemStatus::ExecuteIncrementalTaskFailure => 5,
            JobItemStatus::Finished => 6,
        }
    }

    /// Statuses that only a reset leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobItemStatus::Finished
                | JobItemStatus::ExecuteInventoryTaskFailure
                | JobItemStatus::ExecuteIncrementalTaskFailure
        )
    }

    /// Whether the shared schema preparation still has to run for an item in this status.
    pub fn needs_preparation(&self) -> bool {
        matches!(
            self,
            JobItemStatus::Running | JobItemStatus::Preparing | JobItemStatus::PreparingFailure
        )
    }

    /// Statuses only move forward. Repeating a status is allowed, and so is retrying a failed
    /// preparation.
    pub fn can_transition_to(&self, next: JobItemStatus) -> bool {
        if *self == next {
            return true;
        }
        if *self == JobItemStatus::PreparingFailure && next == JobItemStatus::Preparing {
            return true;
        }
        if self.is_terminal() {
            return false;
        }

        next.rank() >= self.rank()
    }
}

impl fmt::Display for JobItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobItemStatus::Running => "RUNNING",
            JobItemStatus::Preparing => "PREPARING",
            JobItemStatus::PreparingFailure => "PREPARING_FAILURE",
            JobItemStatus::PrepareSuccess => "PREPARE_SUCCESS",
            JobItemStatus::ExecuteInventoryTask => "EXECUTE_INVENTORY_TASK",
            JobItemStatus::ExecuteIncrementalTask => "EXECUTE_INCREMENTAL_TASK",
            JobItemStatus::Finished => "FINISHED",
            JobItemStatus::ExecuteInventoryTaskFailure => "EXECUTE_INVENTORY_TASK_FAILURE",
            JobItemStatus::ExecuteIncrementalTaskFailure => "EXECUTE_INCREMENTAL_TASK_FAILURE",
        };
        f.write_str(name)
    }
}

/// Change capture checkpoint of an item.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IncrementalProgress {
    pub position: Option<IncrementalPosition>,
    /// Commit time of the last applied change, when the source reports one.
    pub latest_event_at: Option<DateTime<Utc>>,
}

/// Persisted state of one sharding item.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobItemProgress {
    pub status: JobItemStatus,
    /// Inventory chunk positions keyed by chunk id.
    #[serde(default)]
    pub inventory: BTreeMap<String, InventoryPosition>,
    #[serde(default)]
    pub incremental: IncrementalProgress,
    #[serde(default)]
    pub processed_records_count: u64,
    #[serde(default)]
    pub inventory_records_count: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for JobItemProgress {
    fn default() -> Self {
        Self {
            status: JobItemStatus::default(),
            inventory: BTreeMap::new(),
            incremental: IncrementalProgress::default(),
            processed_records_count: 0,
            inventory_records_count: 0,
            error_message: None,
            updated_at: Utc::now(),
        }
    }
}

impl JobItemProgress {
    pub fn with_status(status: JobItemStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn set_status(&mut self, next: JobItemStatus) -> MigrationResult<()> {
        if !self.status.can_transition_to(next) {
            bail!(
                ErrorKind::InvalidStatusTransition,
                "Job item status cannot change",
                format!("{} -> {next}", self.status)
            );
        }
        self.status = next;
        self.updated_at = Utc::now();

        Ok(())
    }

    /// Whether every inventory chunk was copied.
    pub fn inventory_finished(&self) -> bool {
        self.inventory.values().all(InventoryPosition::is_finished)
    }

    /// Share of the inventory copied so far, from 0 to 100.
    pub fn inventory_finished_percentage(&self) -> u8 {
        if !self.inventory.is_empty() && self.inventory_finished() {
            return 100;
        }
        if self.inventory_records_count == 0 {
            return 0;
        }

        let percentage = self.processed_records_count.saturating_mul(100)
            / self.inventory_records_count;
        percentage.min(100) as u8
    }
}

/// Live progress of a job item, shared by its tasks and its persister.
///
/// Counters are atomics so the apply paths never wait on a persister holding the lock. Every
/// update marks the progress dirty and wakes the persister.
#[derive(Debug)]
pub struct ItemProgress {
    state: Mutex<JobItemProgress>,
    processed_records_count: AtomicU64,
    inventory_records_count: AtomicU64,
    dirty: AtomicBool,
    notify: Notify,
}

impl ItemProgress {
    pub fn new(progress: JobItemProgress) -> Arc<Self> {
        Arc::new(Self {
            processed_records_count: AtomicU64::new(progress.processed_records_count),
            inventory_records_count: AtomicU64::new(progress.inventory_records_count),
            state: Mutex::new(progress),
            dirty: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn processed_records_count(&self) -> u64 {
        self.processed_records_count.load(Ordering::Acquire)
    }

    pub fn inventory_records_count(&self) -> u64 {
        self.inventory_records_count.load(Ordering::Acquire)
    }

    pub fn add_processed(&self, count: u64) {
        self.processed_records_count
            .fetch_add(count, Ordering::AcqRel);
        self.mark_dirty();
    }

    /// Sets the inventory total unless it was already set. Returns whether it was set now.
    pub fn init_inventory_records_count(&self, count: u64) -> bool {
        let set = self
            .inventory_records_count
            .compare_exchange(0, count, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if set {
            self.mark_dirty();
        }

        set
    }

    pub async fn status(&self) -> JobItemStatus {
        self.state.lock().await.status
    }

    pub async fn set_status(&self, next: JobItemStatus) -> MigrationResult<()> {
        self.state.lock().await.set_status(next)?;
        self.mark_dirty();

        Ok(())
    }

    /// Moves to `next` unless the item is already past it.
    pub async fn advance_status(&self, next: JobItemStatus) -> MigrationResult<()> {
        let mut state = self.state.lock().await;
        if !state.status.is_terminal() && state.status.rank() >= next.rank() {
            return Ok(());
        }
        state.set_status(next)?;
        drop(state);
        self.mark_dirty();

        Ok(())
    }

    pub async fn fail(&self, status: JobItemStatus, message: String) -> MigrationResult<()> {
        let mut state = self.state.lock().await;
        state.set_status(status)?;
        state.error_message = Some(message);
        drop(state);
        self.mark_dirty();

        Ok(())
    }

    /// Records a failure cause without changing the status.
    pub async fn record_error(&self, message: String) {
        self.state.lock().await.error_message = Some(message);
        self.mark_dirty();
    }

    pub async fn set_inventory_position(&self, chunk_id: &str, position: InventoryPosition) {
        let mut state = self.state.lock().await;
        state.inventory.insert(chunk_id.to_string(), position);
        state.updated_at = Utc::now();
        drop(state);
        self.mark_dirty();
    }

    pub async fn inventory_positions(&self) -> BTreeMap<String, InventoryPosition> {
        self.state.lock().await.inventory.clone()
    }

    pub async fn incremental_position(&self) -> Option<IncrementalPosition> {
        self.state.lock().await.incremental.position
    }

    pub async fn set_incremental_position(
        &self,
        position: IncrementalPosition,
        latest_event_at: Option<DateTime<Utc>>,
    ) {
        let mut state = self.state.lock().await;
        state.incremental.position = Some(position);
        if latest_event_at.is_some() {
            state.incremental.latest_event_at = latest_event_at;
        }
        state.updated_at = Utc::now();
        drop(state);
        self.mark_dirty();
    }

    /// Replaces the state with a persisted one. Counters never move backwards.
    pub async fn reload(&self, progress: JobItemProgress) {
        self.processed_records_count
            .fetch_max(progress.processed_records_count, Ordering::AcqRel);
        self.inventory_records_count
            .fetch_max(progress.inventory_records_count, Ordering::AcqRel);
        *self.state.lock().await = progress;
    }

    /// Returns the state with the current counter values.
    pub async fn snapshot(&self) -> JobItemProgress {
        let mut snapshot = self.state.lock().await.clone();
        snapshot.processed_records_count = self.processed_records_count();
        snapshot.inventory_records_count = self.inventory_records_count();
        snapshot
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Clears the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Completes after the next update.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_only_move_forward() {
        use JobItemStatus::*;

        assert!(Running.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(PreparingFailure));
        assert!(PreparingFailure.can_transition_to(Preparing));
        assert!(PreparingFailure.can_transition_to(PrepareSuccess));
        assert!(PrepareSuccess.can_transition_to(ExecuteInventoryTask));
        assert!(ExecuteIncrementalTask.can_transition_to(Finished));
        assert!(Finished.can_transition_to(Finished));

        assert!(!PrepareSuccess.can_transition_to(Preparing));
        assert!(!ExecuteIncrementalTask.can_transition_to(ExecuteInventoryTask));
        assert!(!Finished.can_transition_to(ExecuteIncrementalTask));
        assert!(!ExecuteInventoryTaskFailure.can_transition_to(ExecuteIncrementalTask));
    }

    #[test]
    fn status_serializes_in_screaming_snake_case() {
        let json = serde_json::to_string(&JobItemStatus::PrepareSuccess).unwrap();

        assert_eq!(json, r#""PREPARE_SUCCESS""#);
        assert_eq!(JobItemStatus::PreparingFailure.to_string(), "PREPARING_FAILURE");
    }

    #[test]
    fn progress_round_trips_through_json() {
        let mut progress = JobItemProgress::with_status(JobItemStatus::ExecuteInventoryTask);
        progress
            .inventory
            .insert("t_order#0".to_string(), InventoryPosition::range(1, Some(4)));
        progress.incremental.position = Some(IncrementalPosition::Sequence(12));
        progress.processed_records_count = 3;
        progress.inventory_records_count = 10;

        let json = serde_json::to_string(&progress).unwrap();

        assert_eq!(serde_json::from_str::<JobItemProgress>(&json).unwrap(), progress);
    }

    #[test]
    fn percentage_follows_counters_until_every_chunk_finished() {
        let mut progress = JobItemProgress::default();
        progress.inventory_records_count = 10;
        progress.processed_records_count = 4;
        progress
            .inventory
            .insert("t#0".to_string(), InventoryPosition::range(0, None));

        assert_eq!(progress.inventory_finished_percentage(), 40);

        progress.processed_records_count = 25;
        assert_eq!(progress.inventory_finished_percentage(), 100);

        progress.processed_records_count = 0;
        progress
            .inventory
            .insert("t#0".to_string(), InventoryPosition::Finished);
        assert_eq!(progress.inventory_finished_percentage(), 100);
    }

    #[tokio::test]
    async fn counters_never_decrease() {
        let progress = ItemProgress::new(JobItemProgress::default());
        progress.add_processed(5);
        assert!(progress.init_inventory_records_count(10));
        assert!(!progress.init_inventory_records_count(3));

        let mut stale = JobItemProgress::default();
        stale.processed_records_count = 2;
        stale.inventory_records_count = 1;
        progress.reload(stale).await;

        let snapshot = progress.snapshot().await;
        assert_eq!(snapshot.processed_records_count, 5);
        assert_eq!(snapshot.inventory_records_count, 10);
    }

    #[tokio::test]
    async fn advancing_to_an_earlier_status_is_a_no_op() {
        let progress = ItemProgress::new(JobItemProgress::with_status(
            JobItemStatus::ExecuteIncrementalTask,
        ));

        progress
            .advance_status(JobItemStatus::ExecuteInventoryTask)
            .await
            .unwrap();

        assert_eq!(progress.status().await, JobItemStatus::ExecuteIncrementalTask);
        assert!(!progress.take_dirty());
    }

    #[tokio::test]
    async fn updates_mark_the_progress_dirty() {
        let progress = ItemProgress::new(JobItemProgress::default());
        assert!(!progress.take_dirty());

        progress
            .set_inventory_position("t#0", InventoryPosition::Finished)
            .await;

        assert!(progress.take_dirty());
        assert!(!progress.take_dirty());
        progress.changed().await;
    }
}

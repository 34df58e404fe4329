use std::future::Future;
use std::time::Duration;

use crate::error::MigrationResult;

/// Named mutual exclusion across worker processes.
///
/// Locks are not re-entrant. A holder that dies releases its locks, so a crash never leaves a
/// job locked forever.
pub trait LockService: Clone + Send + Sync + 'static {
    /// Proof of ownership. Dropping it releases the lock as well.
    type Guard: Send + 'static;

    /// Waits up to `timeout` for the lock. Returns `None` when it could not be acquired.
    ///
    /// Dropping the returned future before it completes never leaves the lock held.
    fn try_lock(
        &self,
        name: &str,
        timeout: Duration,
    ) -> impl Future<Output = MigrationResult<Option<Self::Guard>>> + Send;

    fn unlock(&self, guard: Self::Guard) -> impl Future<Output = MigrationResult<()>> + Send;
}

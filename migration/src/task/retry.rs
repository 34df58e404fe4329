use std::future::Future;
use std::time::Duration;

use config::shared::RetryConfig;
use metrics::counter;
use rand::Rng;
use tracing::warn;

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::MigrationResult;
use crate::metrics::{ERROR_KIND_LABEL, MIGRATION_TASK_RETRIES_TOTAL};
use crate::policy::ErrorHandlingPolicy;

/// Exponential backoff for retry `attempt` (1-based), capped and with up to 30% jitter.
pub(crate) fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30) as i32;
    let base_delay_ms = retry.initial_backoff_ms as f64 * 2f64.powi(exponent);
    let capped_delay_ms = base_delay_ms.min(retry.max_backoff_ms as f64);

    let jitter_factor = rand::rng().random::<f64>() * 0.3;
    Duration::from_millis((capped_delay_ms * (1.0 + jitter_factor)) as u64)
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or runs out of attempts.
///
/// A stop request during a backoff returns [`ShutdownResult::Shutdown`] without another attempt.
pub(crate) async fn with_retries<T, F, Fut>(
    retry: &RetryConfig,
    shutdown_rx: &ShutdownRx,
    operation_name: &'static str,
    mut operation: F,
) -> MigrationResult<ShutdownResult<T, ()>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MigrationResult<T>>,
{
    let mut attempt = 1;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(ShutdownResult::Ok(value)),
            Err(err) => err,
        };

        let policy = ErrorHandlingPolicy::from_error(&err);
        if !policy.is_retryable() || attempt >= retry.max_attempts {
            return Err(err);
        }

        let delay = backoff_delay(retry, attempt);
        warn!(
            operation = operation_name,
            attempt,
            max_attempts = retry.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err.cause_message(),
            "operation failed, retrying"
        );
        counter!(
            MIGRATION_TASK_RETRIES_TOTAL,
            ERROR_KIND_LABEL => format!("{:?}", err.kind())
        )
        .increment(1);

        tokio::select! {
            biased;
            _ = shutdown_rx.stopped() => return Ok(ShutdownResult::Shutdown(())),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::error::ErrorKind;
    use crate::migration_error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };

        let first = backoff_delay(&retry, 1);
        let third = backoff_delay(&retry, 3);
        let tenth = backoff_delay(&retry, 10);

        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(130));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(520));
        assert!(tenth <= Duration::from_millis(1_300));
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_until_success() {
        let (_tx, rx) = create_shutdown_channel();
        let calls = AtomicU32::new(0);

        let result = with_retries(&retry(3), &rx, "write", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(migration_error!(ErrorKind::TargetWriteFailed, "Write failed"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, ShutdownResult::Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let (_tx, rx) = create_shutdown_channel();
        let calls = AtomicU32::new(0);

        let err = with_retries(&retry(2), &rx, "write", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(migration_error!(ErrorKind::TargetWriteFailed, "Write failed"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TargetWriteFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let (_tx, rx) = create_shutdown_channel();
        let calls = AtomicU32::new(0);

        let err = with_retries(&retry(5), &rx, "read", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(migration_error!(ErrorKind::MissingUniqueKey, "No key"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MissingUniqueKey);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

use crate::error::{ErrorKind, MigrationError};

/// Retry behavior for a classified error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// The operation can be retried automatically after a backoff.
    Retry,
    /// The job item must stop. Retrying could skip or duplicate data.
    Fatal,
}

/// Policy describing how a [`MigrationError`] is handled by tasks and job items.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    /// Classifies `error`. Aggregated errors are fatal as soon as one of them is.
    pub fn from_error(error: &MigrationError) -> ErrorHandlingPolicy {
        let kinds = error.kinds();
        let mut policy = Self::from_kind(error.kind());
        for kind in kinds {
            let candidate = Self::from_kind(kind);
            if candidate.retry_directive == RetryDirective::Fatal {
                policy = candidate;
                break;
            }
        }

        policy
    }

    fn from_kind(kind: ErrorKind) -> ErrorHandlingPolicy {
        match kind {
            // Transient failures that recover without operator intervention.
            ErrorKind::SourceConnectionFailed
            | ErrorKind::TargetConnectionFailed
            | ErrorKind::CoordinationFailed
            | ErrorKind::LockTimeout
            | ErrorKind::SourceQueryFailed
            | ErrorKind::TargetWriteFailed
            | ErrorKind::IoError => Self::new(RetryDirective::Retry, None),

            // Schema preparation is retried by re-preparing the item.
            ErrorKind::SchemaPreparationFailed => Self::new(
                RetryDirective::Retry,
                Some("Inspect the target for partially created tables if the failure persists."),
            ),

            ErrorKind::PositionAcquisitionFailed => Self::new(
                RetryDirective::Fatal,
                Some("Verify that the source supports change capture and that a replication slot can be created."),
            ),
            ErrorKind::MissingUniqueKey => Self::new(
                RetryDirective::Fatal,
                Some("Configure a unique key column for the table."),
            ),
            ErrorKind::MissingTable => Self::new(
                RetryDirective::Fatal,
                Some("Create the table or fix the table mapping of the job."),
            ),

            #[cfg(feature = "failpoints")]
            ErrorKind::WithRetry => Self::new(RetryDirective::Retry, None),
            #[cfg(feature = "failpoints")]
            ErrorKind::WithNoRetry => {
                Self::new(RetryDirective::Fatal, Some("Cannot retry this error."))
            }

            _ => Self::new(RetryDirective::Fatal, None),
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_directive == RetryDirective::Retry
    }

    /// Returns an optional operator-facing solution message.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

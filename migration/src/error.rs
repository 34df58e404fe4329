//! Error types and result definitions for migration jobs.
//!
//! [`MigrationError`] carries a coarse [`ErrorKind`] used to pick a retry strategy, a static
//! description, optional dynamic detail and the source error, and can aggregate the failures of
//! many concurrently running tasks into one value.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result type returned by fallible migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the migration engine.
#[derive(Debug, Clone)]
pub struct MigrationError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Failures of several tasks, e.g. all inventory chunks of a job item.
    Many {
        errors: Vec<MigrationError>,
        location: &'static Location<'static>,
    },
}

/// Category of a [`MigrationError`].
///
/// The kind drives [`crate::policy::ErrorHandlingPolicy`], so new kinds must be classified there.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connectivity
    SourceConnectionFailed,
    TargetConnectionFailed,
    CoordinationFailed,

    // Reads and writes
    SourceQueryFailed,
    TargetWriteFailed,

    // Preparation
    LockTimeout,
    SchemaPreparationFailed,
    PositionAcquisitionFailed,
    MissingUniqueKey,
    MissingTable,

    // Progress and job state
    InvalidPosition,
    InvalidStatusTransition,
    InvalidJobState,
    DuplicateJobId,
    JobNotFound,
    ConsistencyCheckNotPassed,

    // Encoding
    ProtocolError,
    ConversionError,
    IoError,
    SerializationError,
    DeserializationError,

    // Configuration
    ConfigError,

    // Workers
    TaskPanic,

    Unknown,

    // Injected by fail points to drive retry behavior in tests.
    #[cfg(feature = "failpoints")]
    WithRetry,
    #[cfg(feature = "failpoints")]
    WithNoRetry,
}

impl MigrationError {
    /// Returns the kind of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every kind contained in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "multiple errors occurred",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Returns the aggregated errors, if this error aggregates several.
    pub fn errors(&self) -> Option<&[MigrationError]> {
        match self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { ref errors, .. } => Some(errors),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Renders a single-line cause suitable for the job item progress.
    ///
    /// Unlike [`fmt::Display`] this omits locations and backtraces.
    pub fn cause_message(&self) -> String {
        match &self.repr {
            ErrorRepr::Single(payload) => match &payload.detail {
                Some(detail) => format!("[{:?}] {}: {}", payload.kind, payload.description, detail),
                None => format!("[{:?}] {}", payload.kind, payload.description),
            },
            ErrorRepr::Many { errors, .. } => errors
                .iter()
                .map(|err| err.cause_message())
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    /// Attaches the originating error. Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        MigrationError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl PartialEq for MigrationError {
    fn eq(&self, other: &MigrationError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Hash for MigrationError {
    /// Hashes only the kind and static description so repeated failures group together.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = &payload.detail {
                    write!(f, "\n  Detail:")?;
                    for line in detail.lines() {
                        write!(f, "\n    {line}")?;
                    }
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(
                    f,
                    "[Many] {} errors aggregated @ {}:{}:{}",
                    errors.len(),
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    if let Some(first_line) = lines.next() {
                        write!(f, "\n  {}. {}", index + 1, first_line)?;
                    }
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

impl error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for MigrationError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> MigrationError {
        MigrationError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for MigrationError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> MigrationError {
        MigrationError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for MigrationError
where
    E: Into<MigrationError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> MigrationError {
        let location = Location::caller();
        let mut errors: Vec<MigrationError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        MigrationError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for MigrationError {
    #[track_caller]
    fn from(err: std::io::Error) -> MigrationError {
        let detail = err.to_string();
        MigrationError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for MigrationError {
    #[track_caller]
    fn from(err: serde_json::Error) -> MigrationError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        MigrationError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<prost::DecodeError> for MigrationError {
    #[track_caller]
    fn from(err: prost::DecodeError) -> MigrationError {
        let detail = err.to_string();
        MigrationError::from_components(
            ErrorKind::ProtocolError,
            Cow::Borrowed("CDC message decoding failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Classifies sqlx errors as seen from the source side.
///
/// Target and registry code paths map errors explicitly to their own kinds.
impl From<sqlx::Error> for MigrationError {
    #[track_caller]
    fn from(err: sqlx::Error) -> MigrationError {
        let kind = if is_connectivity_error(&err) {
            ErrorKind::SourceConnectionFailed
        } else {
            ErrorKind::SourceQueryFailed
        };

        let detail = err.to_string();
        MigrationError::from_components(
            kind,
            Cow::Borrowed("Database operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Returns whether a sqlx error means the server could not be reached.
pub(crate) fn is_connectivity_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration_error;

    #[test]
    fn aggregating_one_error_returns_it_unchanged() {
        let err: MigrationError =
            vec![migration_error!(ErrorKind::LockTimeout, "Lock not acquired")].into();

        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert!(err.errors().is_none());
    }

    #[test]
    fn aggregated_errors_expose_every_kind() {
        let err: MigrationError = vec![
            migration_error!(ErrorKind::SourceQueryFailed, "Read failed"),
            migration_error!(ErrorKind::TargetWriteFailed, "Write failed"),
        ]
        .into();

        assert_eq!(
            err.kinds(),
            vec![ErrorKind::SourceQueryFailed, ErrorKind::TargetWriteFailed]
        );
        assert_eq!(err.kind(), ErrorKind::SourceQueryFailed);
        assert_eq!(err.errors().map(|errors| errors.len()), Some(2));
    }

    #[test]
    fn cause_message_contains_kind_description_and_detail() {
        let err = migration_error!(
            ErrorKind::PositionAcquisitionFailed,
            "Could not read the current position",
            "slot `migration_j01` is missing"
        );

        assert_eq!(
            err.cause_message(),
            "[PositionAcquisitionFailed] Could not read the current position: slot `migration_j01` is missing"
        );
    }

    #[test]
    fn display_includes_call_site() {
        let err = migration_error!(ErrorKind::JobNotFound, "Job does not exist");

        let rendered = err.to_string();

        assert!(rendered.starts_with("[JobNotFound] Job does not exist @ "));
        assert!(rendered.contains("error.rs"));
    }

    #[test]
    fn source_is_exposed_through_error_trait() {
        let io = std::io::Error::other("disk full");
        let err = migration_error!(ErrorKind::TargetWriteFailed, "Write failed", source: io);

        let source = error::Error::source(&err).map(|source| source.to_string());

        assert_eq!(source.as_deref(), Some("disk full"));
    }
}

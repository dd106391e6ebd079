//! The structured error surfaced at component boundaries.
//!
//! Errors carry a kind, a message, and (where relevant) context fields.
//! They cross component boundaries as values; event handlers log them,
//! user-facing operations return them verbatim.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use delegate_db::queries::dependencies::DependencyError;

/// Classification of a [`DelegateError`]. Stable across refactors of the
/// variant payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    InvalidOperation,
    TaskNotFound,
    DependencyCycle,
    DependencyExists,
    DepthExceeded,
    FanOutExceeded,
    ResourceExhausted,
    InsufficientResources,
    WorkerSpawnFailed,
    Timeout,
    SystemError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::InvalidOperation => "INVALID_OPERATION",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::DependencyCycle => "DEPENDENCY_CYCLE",
            Self::DependencyExists => "DEPENDENCY_EXISTS",
            Self::DepthExceeded => "DEPTH_EXCEEDED",
            Self::FanOutExceeded => "FANOUT_EXCEEDED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::InsufficientResources => "INSUFFICIENT_RESOURCES",
            Self::WorkerSpawnFailed => "WORKER_SPAWN_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::SystemError => "SYSTEM_ERROR",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorKind {
    type Err = ErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVALID_INPUT" => Ok(Self::InvalidInput),
            "INVALID_OPERATION" => Ok(Self::InvalidOperation),
            "TASK_NOT_FOUND" => Ok(Self::TaskNotFound),
            "DEPENDENCY_CYCLE" => Ok(Self::DependencyCycle),
            "DEPENDENCY_EXISTS" => Ok(Self::DependencyExists),
            "DEPTH_EXCEEDED" => Ok(Self::DepthExceeded),
            "FANOUT_EXCEEDED" => Ok(Self::FanOutExceeded),
            "RESOURCE_EXHAUSTED" => Ok(Self::ResourceExhausted),
            "INSUFFICIENT_RESOURCES" => Ok(Self::InsufficientResources),
            "WORKER_SPAWN_FAILED" => Ok(Self::WorkerSpawnFailed),
            "TIMEOUT" => Ok(Self::Timeout),
            "SYSTEM_ERROR" => Ok(Self::SystemError),
            other => Err(ErrorKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ErrorKind`] string.
#[derive(Debug, Clone)]
pub struct ErrorKindParseError(pub String);

impl fmt::Display for ErrorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error kind: {:?}", self.0)
    }
}

impl std::error::Error for ErrorKindParseError {}

// ---------------------------------------------------------------------------

/// The error type crossing delegate component boundaries.
#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("dependency already exists: {0}")]
    DependencyExists(String),

    #[error("dependency chain too deep: {0}")]
    DepthExceeded(String),

    #[error("dependency fan-in exceeded: {0}")]
    FanOutExceeded(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("worker spawn failed: {source}")]
    WorkerSpawnFailed {
        #[source]
        source: anyhow::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    System(#[from] anyhow::Error),
}

impl DelegateError {
    /// The stable classification for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Self::TaskNotFound(_) => ErrorKind::TaskNotFound,
            Self::DependencyCycle(_) => ErrorKind::DependencyCycle,
            Self::DependencyExists(_) => ErrorKind::DependencyExists,
            Self::DepthExceeded(_) => ErrorKind::DepthExceeded,
            Self::FanOutExceeded(_) => ErrorKind::FanOutExceeded,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::InsufficientResources(_) => ErrorKind::InsufficientResources,
            Self::WorkerSpawnFailed { .. } => ErrorKind::WorkerSpawnFailed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::System(_) => ErrorKind::SystemError,
        }
    }

    /// Whether a retry has any chance of succeeding.
    ///
    /// Transient conditions (timeouts, busy resources) are retryable;
    /// validation, conflicts, and missing entities never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout
                | ErrorKind::ResourceExhausted
                | ErrorKind::InsufficientResources
                | ErrorKind::SystemError
        )
    }
}

impl From<DependencyError> for DelegateError {
    fn from(e: DependencyError) -> Self {
        match &e {
            DependencyError::SelfEdge(_) | DependencyError::Cycle { .. } => {
                Self::DependencyCycle(e.to_string())
            }
            DependencyError::AlreadyExists { .. } => Self::DependencyExists(e.to_string()),
            DependencyError::FanOutExceeded { .. } => Self::FanOutExceeded(e.to_string()),
            DependencyError::DepthExceeded { .. } => Self::DepthExceeded(e.to_string()),
            DependencyError::Db(_) => Self::System(anyhow::Error::new(e)),
        }
    }
}

/// Shorthand used throughout the crate.
pub type Result<T, E = DelegateError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display_roundtrip() {
        let kinds = [
            ErrorKind::InvalidInput,
            ErrorKind::InvalidOperation,
            ErrorKind::TaskNotFound,
            ErrorKind::DependencyCycle,
            ErrorKind::DependencyExists,
            ErrorKind::DepthExceeded,
            ErrorKind::FanOutExceeded,
            ErrorKind::ResourceExhausted,
            ErrorKind::InsufficientResources,
            ErrorKind::WorkerSpawnFailed,
            ErrorKind::Timeout,
            ErrorKind::SystemError,
        ];
        for k in &kinds {
            let parsed: ErrorKind = k.to_string().parse().expect("should parse");
            assert_eq!(*k, parsed);
        }
    }

    #[test]
    fn dependency_error_maps_to_kinds() {
        let id = Uuid::new_v4();
        let e: DelegateError = DependencyError::SelfEdge(id).into();
        assert_eq!(e.kind(), ErrorKind::DependencyCycle);

        let e: DelegateError = DependencyError::AlreadyExists {
            task_id: id,
            depends_on: Uuid::new_v4(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::DependencyExists);

        let e: DelegateError = DependencyError::DepthExceeded { depth: 101 }.into();
        assert_eq!(e.kind(), ErrorKind::DepthExceeded);
    }

    #[test]
    fn retryable_classification() {
        assert!(DelegateError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(DelegateError::ResourceExhausted("queue full".into()).is_retryable());
        assert!(!DelegateError::InvalidInput("empty prompt".into()).is_retryable());
        assert!(!DelegateError::DependencyExists("a->b".into()).is_retryable());
        assert!(!DelegateError::TaskNotFound(Uuid::new_v4()).is_retryable());
    }
}

//! Error types for arbitration and scheduling operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::serde::{RequestId, TaskId};

/// Classification of a terminal request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestFailureKind {
    /// A device selector named a device that is not registered.
    UnknownDevice,
    /// A device selector named a type with no registered device.
    UnknownDeviceType,
    /// A sample prefix matched no (or too few) sample positions.
    UnknownSamplePosition,
    /// The request spec itself is malformed.
    MalformedSpec,
    /// The task was orphaned by a restart and abandoned by the operator.
    Orphaned,
}

/// Serialized error payload stored on an errored request and re-raised in the
/// waiting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFailure {
    /// Failure classification.
    pub kind: RequestFailureKind,
    /// Human-readable message.
    pub message: String,
}

impl RequestFailure {
    /// Build a failure payload.
    pub fn new(kind: RequestFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Resource is held by another task this tick. Retried silently by the
    /// admission pass and never surfaced to a waiting client.
    #[error("admission conflict on {0}")]
    AdmissionConflict(String),
    /// A command or release was attempted by a task that does not own the entity.
    #[error("ownership violation: task {task} does not own {entity}")]
    OwnershipViolation {
        /// Task that attempted the operation.
        task: TaskId,
        /// Device or sample position name.
        entity: String,
    },
    /// The request failed terminally; the payload is re-raised in the client.
    #[error("request {request} failed: {failure}")]
    RequestError {
        /// Failed request.
        request: RequestId,
        /// Serialized failure payload.
        failure: RequestFailure,
    },
    /// The client's own wait timed out.
    #[error("timed out waiting for {0}")]
    Timeout(String),
    /// Cooperative cancellation was observed.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A status transition is not allowed from the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    /// Input failed validation (task parameters, specs, registrations).
    #[error("validation failed: {0}")]
    Validation(String),
    /// The worker-execution collaborator could not start a task.
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    /// Persistence-store failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_failure_round_trips_through_json() {
        let failure = RequestFailure::new(RequestFailureKind::UnknownDevice, "no device `x`");
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("unknown_device"));
        let back: RequestFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failure);
    }

    #[test]
    fn test_error_display() {
        let err = SchedulerError::Backend("disk full".into());
        assert_eq!(err.to_string(), "backend error: disk full");
        let err = SchedulerError::Timeout("request".into());
        assert_eq!(err.to_string(), "timed out waiting for request");
    }
}

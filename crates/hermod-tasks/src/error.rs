//! Task-specific error types

use hermod_bus::BusError;
use hermod_common::FabricError;
use thiserror::Error;

use crate::state::TaskState;

/// Result type alias for task operations
pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// Task-specific error types
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Task expired: {0}")]
    Expired(String),

    #[error("Task failed: {0}")]
    ExecutionFailed(String),

    #[error("Max retries exceeded: {0}")]
    MaxRetriesExceeded(String),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Queue stopped")]
    QueueStopped,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TaskError> for FabricError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Backend(s) => FabricError::Internal(s),
            TaskError::TaskNotFound(s) => FabricError::TaskNotFound(s),
            TaskError::HandlerNotFound(s) => FabricError::TaskNotFound(s),
            TaskError::InvalidTaskId(s) => FabricError::InvalidMessage(s),
            TaskError::Serialization(s) => FabricError::InvalidPayload(s),
            TaskError::Timeout(s) => FabricError::TaskTimeout(s),
            TaskError::Cancelled(s) => FabricError::TaskCancelled(s),
            TaskError::Expired(s) => FabricError::TaskExpired(s),
            TaskError::ExecutionFailed(s) => FabricError::TaskFailed(s),
            TaskError::MaxRetriesExceeded(s) => FabricError::TaskFailed(s),
            TaskError::InvalidTransition { from, to } => {
                FabricError::Internal(format!("invalid state transition {from:?} -> {to:?}"))
            }
            TaskError::InvalidWorkflow(s) => FabricError::Configuration(s),
            TaskError::InvalidSchedule(s) => FabricError::Configuration(s),
            TaskError::QueueFull(s) => FabricError::QueueFull(s),
            TaskError::QueueStopped => FabricError::QueueStopped,
            TaskError::Configuration(s) => FabricError::Configuration(s),
            TaskError::Internal(s) => FabricError::Internal(s),
        }
    }
}

impl From<BusError> for TaskError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::QueueFull(s) => TaskError::QueueFull(s),
            BusError::QueueStopped => TaskError::QueueStopped,
            BusError::InvalidPayload(s) => TaskError::Serialization(s),
            other => TaskError::Internal(other.to_string()),
        }
    }
}

impl From<uuid::Error> for TaskError {
    fn from(err: uuid::Error) -> Self {
        TaskError::InvalidTaskId(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_fabric_codes() {
        let err: FabricError = TaskError::Cancelled("t".into()).into();
        assert_eq!(err.code(), 1602);
        let err: FabricError = TaskError::Timeout("t".into()).into();
        assert_eq!(err.code(), 1604);
        let err: FabricError = TaskError::QueueFull("q".into()).into();
        assert_eq!(err.code(), 1200);
    }
}

//! Task state machine

use serde::{Deserialize, Serialize};

/// Task state in its lifecycle.
///
/// ```text
/// PENDING -> QUEUED -> RUNNING -> SUCCEEDED
///                 |           |-> FAILED (no retries left)
///                 |           '-> RETRYING -> QUEUED
///                 |-> CANCELLED
///                 '-> EXPIRED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created but not yet enqueued
    #[default]
    Pending,
    /// Waiting in a queue (or the delayed queue)
    Queued,
    /// Being executed by a worker
    Running,
    /// Attempt failed, waiting for its backoff re-enqueue
    Retrying,
    /// Completed successfully
    Succeeded,
    /// Failed with no retries left
    Failed,
    /// Cancelled before or during execution
    Cancelled,
    /// Missed its deadline before execution
    Expired,
}

impl TaskState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    /// Check if the task is somewhere between enqueue and completion
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Retrying)
    }

    /// Valid state transitions
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (Self::Pending, Self::Queued) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Pending, Self::Expired) => true,

            (Self::Queued, Self::Running) => true,
            (Self::Queued, Self::Cancelled) => true,
            (Self::Queued, Self::Expired) => true,

            (Self::Running, Self::Succeeded) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Running, Self::Retrying) => true,
            (Self::Running, Self::Cancelled) => true,

            (Self::Retrying, Self::Queued) => true,
            (Self::Retrying, Self::Cancelled) => true,
            (Self::Retrying, Self::Failed) => true,

            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Retrying => "RETRYING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

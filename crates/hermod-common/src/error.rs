//! Error types for hermod

use thiserror::Error;

/// Result type alias for hermod operations
pub type Result<T> = std::result::Result<T, FabricError>;

/// Unified error type for all hermod operations.
///
/// Crate-level errors (`BusError`, `TaskError`) convert into this umbrella
/// at the boundary of the fabric. Each variant belongs to a stable integer
/// code band exposed through [`FabricError::code`].
#[derive(Error, Debug, Clone)]
pub enum FabricError {
    // ---- Message (1000s) ----
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message too large: {0}")]
    MessageTooLarge(String),

    #[error("Message expired: {0}")]
    MessageExpired(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // ---- Routing (1100s) ----
    #[error("Routing failed: {0}")]
    RoutingFailed(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("No subscribers for topic: {0}")]
    NoSubscribers(String),

    #[error("Invalid topic pattern: {0}")]
    InvalidTopicPattern(String),

    // ---- Queue (1200s) ----
    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Queue empty")]
    QueueEmpty,

    #[error("Queue stopped")]
    QueueStopped,

    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("Dequeue failed: {0}")]
    DequeueFailed(String),

    // ---- Subscription (1300s) ----
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Duplicate subscription: {0}")]
    DuplicateSubscription(String),

    #[error("Unsubscribe failed: {0}")]
    UnsubscribeFailed(String),

    // ---- Publishing (1400s) ----
    #[error("Publication failed: {0}")]
    PublicationFailed(String),

    #[error("No route found: {0}")]
    NoRouteFound(String),

    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    // ---- Transport (1500s) ----
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send timeout: {0}")]
    SendTimeout(String),

    #[error("Receive timeout: {0}")]
    ReceiveTimeout(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Not connected")]
    NotConnected,

    // ---- Task (1600s) ----
    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task cancelled: {0}")]
    TaskCancelled(String),

    #[error("Task expired: {0}")]
    TaskExpired(String),

    #[error("Task timeout: {0}")]
    TaskTimeout(String),

    // ---- Internal (1900s) ----
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FabricError {
    /// Stable integer code for the error, grouped in bands per category.
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidMessage(_) => 1000,
            Self::MessageTooLarge(_) => 1001,
            Self::MessageExpired(_) => 1002,
            Self::InvalidPayload(_) => 1003,

            Self::RoutingFailed(_) => 1100,
            Self::UnknownTopic(_) => 1101,
            Self::NoSubscribers(_) => 1102,
            Self::InvalidTopicPattern(_) => 1103,

            Self::QueueFull(_) => 1200,
            Self::QueueEmpty => 1201,
            Self::QueueStopped => 1202,
            Self::EnqueueFailed(_) => 1203,
            Self::DequeueFailed(_) => 1204,

            Self::SubscriptionFailed(_) => 1300,
            Self::SubscriptionNotFound(_) => 1301,
            Self::DuplicateSubscription(_) => 1302,
            Self::UnsubscribeFailed(_) => 1303,

            Self::PublicationFailed(_) => 1400,
            Self::NoRouteFound(_) => 1401,
            Self::MessageRejected(_) => 1402,
            Self::BrokerUnavailable(_) => 1403,

            Self::ConnectionFailed(_) => 1500,
            Self::SendTimeout(_) => 1501,
            Self::ReceiveTimeout(_) => 1502,
            Self::AuthenticationFailed(_) => 1503,
            Self::NotConnected => 1504,

            Self::TaskFailed(_) => 1600,
            Self::TaskNotFound(_) => 1601,
            Self::TaskCancelled(_) => 1602,
            Self::TaskExpired(_) => 1603,
            Self::TaskTimeout(_) => 1604,

            Self::Configuration(_) => 1900,
            Self::Internal(_) => 1901,
        }
    }

    /// Returns true if this error is potentially retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull(_)
                | Self::SendTimeout(_)
                | Self::ReceiveTimeout(_)
                | Self::ConnectionFailed(_)
                | Self::TaskTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_bands() {
        assert_eq!(FabricError::InvalidMessage("x".into()).code() / 100, 10);
        assert_eq!(FabricError::InvalidTopicPattern("x".into()).code() / 100, 11);
        assert_eq!(FabricError::QueueFull("x".into()).code() / 100, 12);
        assert_eq!(FabricError::SubscriptionNotFound("x".into()).code() / 100, 13);
        assert_eq!(FabricError::NoRouteFound("x".into()).code() / 100, 14);
        assert_eq!(FabricError::NotConnected.code() / 100, 15);
        assert_eq!(FabricError::TaskCancelled("x".into()).code() / 100, 16);
        assert_eq!(FabricError::Internal("x".into()).code() / 100, 19);
    }

    #[test]
    fn test_retryable() {
        assert!(FabricError::QueueFull("q".into()).is_retryable());
        assert!(FabricError::ReceiveTimeout("t".into()).is_retryable());
        assert!(!FabricError::InvalidMessage("m".into()).is_retryable());
    }
}

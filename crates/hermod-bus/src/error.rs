//! Bus-specific error types

use hermod_common::FabricError;
use thiserror::Error;

/// Result type alias for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Bus-specific error types
#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Message expired: {0}")]
    MessageExpired(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid topic pattern: {0}")]
    InvalidTopicPattern(String),

    #[error("Routing failed: {0}")]
    RoutingFailed(String),

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("Queue empty")]
    QueueEmpty,

    #[error("Queue stopped")]
    QueueStopped,

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Duplicate route: {0}")]
    DuplicateRoute(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Request timed out after {0:?}")]
    RequestTimeout(std::time::Duration),

    #[error("Backend not ready: {0}")]
    BackendNotReady(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BusError> for FabricError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::InvalidMessage(s) => FabricError::InvalidMessage(s),
            BusError::MessageTooLarge { size, max } => {
                FabricError::MessageTooLarge(format!("{size} bytes (max {max})"))
            }
            BusError::MessageExpired(s) => FabricError::MessageExpired(s),
            BusError::InvalidPayload(s) => FabricError::InvalidPayload(s),
            BusError::InvalidTopicPattern(s) => FabricError::InvalidTopicPattern(s),
            BusError::RoutingFailed(s) => FabricError::RoutingFailed(s),
            BusError::QueueFull(s) => FabricError::QueueFull(s),
            BusError::QueueEmpty => FabricError::QueueEmpty,
            BusError::QueueStopped => FabricError::QueueStopped,
            BusError::SubscriptionNotFound(s) => FabricError::SubscriptionNotFound(s),
            BusError::DuplicateRoute(s) => FabricError::DuplicateSubscription(s),
            BusError::RouteNotFound(s) => FabricError::NoRouteFound(s),
            BusError::BrokerUnavailable(s) => FabricError::BrokerUnavailable(s),
            BusError::RequestTimeout(d) => FabricError::ReceiveTimeout(format!("{d:?}")),
            BusError::BackendNotReady(s) => FabricError::ConnectionFailed(s),
            BusError::Internal(s) => FabricError::Internal(s),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::InvalidPayload(err.to_string())
    }
}

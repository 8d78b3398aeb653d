//! In-process publish/subscribe message bus with hierarchical topic routing.
//!
//! The bus delivers typed [`Message`]s from producers to handlers matched by
//! dot-separated topic patterns (`*` single segment, `#` trailing rest),
//! with priority ordering, bounded queueing with back-pressure, request/reply
//! correlation and pluggable execution backends.
//!
//! # Example
//! ```rust,ignore
//! use hermod_bus::{BusConfig, FnHandler, Message, MessageBus, StandaloneBackend};
//! use std::sync::Arc;
//!
//! let backend = Arc::new(StandaloneBackend::new());
//! let bus = MessageBus::new(backend, BusConfig::default());
//! bus.start().await?;
//!
//! bus.subscribe("user.#", Arc::new(FnHandler::new(|msg| {
//!     println!("got {}", msg.topic);
//!     Ok(())
//! })))?;
//!
//! bus.publish(Message::builder("user.created").build()?)?;
//! ```

pub mod backend;
pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod pattern;
pub mod queue;
pub mod router;
pub mod value;
pub mod wire;

pub use backend::{
    Backend, BackendKind, Executor, IntegratedBackend, LogLevel, LogSink, MetricsSink,
    StandaloneBackend, TokioExecutor, TracingLogSink,
};
pub use broker::{BrokerStats, BrokerStatsSnapshot, MessageBroker, RouteInfo};
pub use bus::{BusStats, BusStatsSnapshot, MessageBus};
pub use config::{BrokerConfig, BusConfig, OverflowPolicy, QueueConfig};
pub use error::{BusError, BusResult};
pub use message::{Message, MessageBuilder, MessageId, MessageType, Priority};
pub use pattern::{validate_topic, TopicPattern};
pub use queue::{MessageQueue, QueueStatsSnapshot};
pub use router::{
    DispatchReport, FnHandler, MessageFilter, MessageHandler, SubscriptionId, TopicRouter,
    DEFAULT_PRIORITY,
};
pub use value::{SharedContainer, Value, ValueContainer};

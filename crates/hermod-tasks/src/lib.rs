//! Background task subsystem for the hermod fabric.
//!
//! Tasks are message-shaped units of work with retry, timeout, progress and
//! result semantics. A [`TaskSystem`] composes the multi-queue
//! [`TaskQueue`], an in-memory (or pluggable) [`ResultBackend`], a
//! [`WorkerPool`] executing registered handlers, a cron/interval
//! [`Scheduler`] and a [`Monitor`] of lifecycle events.
//!
//! # Example
//! ```rust,ignore
//! use hermod_tasks::{TaskBuilder, TaskOutcome, TaskSystem, TaskSystemConfig};
//! use hermod_bus::ValueContainer;
//!
//! let system = TaskSystem::new(TaskSystemConfig::default());
//! system.register_handler_fn("math.add", |_ctx, payload| async move {
//!     let sum = payload.get_i64("a").unwrap_or(0) + payload.get_i64("b").unwrap_or(0);
//!     TaskOutcome::Success(ValueContainer::new().with("sum", sum))
//! });
//! system.start().await?;
//!
//! let result = system
//!     .submit("math.add", ValueContainer::new().with("a", 1i64).with("b", 2i64))
//!     .await?;
//! let payload = result.get(Duration::from_secs(5)).await?;
//! ```

pub mod backend;
pub mod client;
pub mod context;
pub mod error;
pub mod monitor;
pub mod queue;
pub mod result;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod system;
pub mod task;
pub mod worker;
pub mod workflow;

pub use backend::{InMemoryResultBackend, ResultBackend, TaskRecord};
pub use client::TaskClient;
pub use context::TaskContext;
pub use error::{TaskError, TaskResult};
pub use monitor::{EventHandler, Monitor, TaskEvent};
pub use queue::{TaskQueue, TaskQueueConfig};
pub use result::AsyncResult;
pub use retry::RetryPolicy;
pub use scheduler::{ScheduleEntry, Scheduler, SchedulerConfig, SchedulerTimezone, Trigger};
pub use state::TaskState;
pub use system::{TaskSystem, TaskSystemConfig};
pub use task::{
    FnTaskHandler, HandlerRegistry, Task, TaskBuilder, TaskConfig, TaskHandler, TaskId,
    TaskOutcome,
};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerStatsSnapshot};
pub use workflow::{Chain, ChainResult, Chord, ChordResult, TaskSignature};

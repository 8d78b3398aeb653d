//! Core task types, handler trait and handler registry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hermod_bus::{Priority, ValueContainer};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::retry::RetryPolicy;
use crate::state::TaskState;

/// Unique task identifier using UUID v7 (time-ordered)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub uuid::Uuid);

impl TaskId {
    /// Create a new task ID
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// Parse from string
    pub fn from_string(s: &str) -> Result<Self, TaskError> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TaskError::InvalidTaskId(e.to_string()))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-task configuration; every recognized option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Hard cap per attempt; exceeding it fails the attempt
    pub timeout: Option<Duration>,
    /// Retry behavior after a failed attempt
    pub retry: RetryPolicy,
    /// Queue ordering when the queue is priority-enabled
    pub priority: Priority,
    /// Absolute earliest execution time
    pub eta: Option<DateTime<Utc>>,
    /// Relative deadline from creation; past it the task expires unrun
    pub expires_in: Option<Duration>,
    /// Target named queue
    pub queue: String,
    /// Labels for group cancellation and filtering
    pub tags: Vec<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: RetryPolicy::default(),
            priority: Priority::Normal,
            eta: None,
            expires_in: None,
            queue: "default".to_string(),
            tags: Vec::new(),
        }
    }
}

/// A unit of background work.
///
/// A task owns its payload container outright; it is never stored as a
/// message. Metadata ids (trace, correlation, parent, root) travel with it
/// through every retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub config: TaskConfig,
    pub payload: ValueContainer,
    /// Stamped by the queue at enqueue time
    pub created_at: Option<DateTime<Utc>>,
    /// Retry attempts so far
    pub retries: u32,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub parent_id: Option<TaskId>,
    pub root_id: Option<TaskId>,
}

impl Task {
    /// Start building a task for handler `name`
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    /// Regenerate the task id, keeping metadata ids in sync.
    ///
    /// Used when a template task (schedule entry, workflow signature) is
    /// instantiated for another run.
    pub fn regenerate_id(&mut self) -> &TaskId {
        self.id = TaskId::new();
        if self.correlation_id.is_none() {
            self.correlation_id = Some(self.id.to_string());
        }
        &self.id
    }

    /// Check whether the task has outlived its relative deadline
    pub fn is_expired(&self) -> bool {
        match (self.config.expires_in, self.created_at) {
            (Some(expires_in), Some(created_at)) => chrono::Duration::from_std(expires_in)
                .ok()
                .and_then(|d| created_at.checked_add_signed(d))
                .map(|deadline| Utc::now() > deadline)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Check whether the task's eta has passed (ready to execute)
    pub fn is_ready(&self) -> bool {
        self.config.eta.map(|eta| eta <= Utc::now()).unwrap_or(true)
    }

    /// Clone for a retry attempt: bumps the retry count and schedules the
    /// next attempt at `eta`.
    pub fn for_retry(mut self, eta: DateTime<Utc>) -> Self {
        self.retries += 1;
        self.config.eta = Some(eta);
        self.state = TaskState::Retrying;
        self
    }
}

/// Builder for [`Task`]
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    payload: ValueContainer,
    config: TaskConfig,
    correlation_id: Option<String>,
    trace_id: Option<String>,
    parent_id: Option<TaskId>,
    root_id: Option<TaskId>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: ValueContainer::new(),
            config: TaskConfig::default(),
            correlation_id: None,
            trace_id: None,
            parent_id: None,
            root_id: None,
        }
    }

    pub fn payload(mut self, payload: ValueContainer) -> Self {
        self.payload = payload;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry.retry_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry.backoff_multiplier = multiplier;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.config.priority = priority;
        self
    }

    /// Absolute earliest execution time
    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.config.eta = Some(eta);
        self
    }

    /// Relative delay before the task becomes eligible to run
    pub fn delay(mut self, delay: Duration) -> Self {
        self.config.eta = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self
    }

    /// Relative deadline; past it the task expires without running
    pub fn expires_in(mut self, expires_in: Duration) -> Self {
        self.config.expires_in = Some(expires_in);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.config.queue = queue.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.config.tags.push(tag.into());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.config.tags.extend(tags);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    pub fn parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn root(mut self, root_id: TaskId) -> Self {
        self.root_id = Some(root_id);
        self
    }

    pub fn build(self) -> Task {
        Task {
            id: TaskId::new(),
            name: self.name,
            state: TaskState::Pending,
            config: self.config,
            payload: self.payload,
            created_at: None,
            retries: 0,
            correlation_id: self.correlation_id,
            trace_id: self.trace_id,
            parent_id: self.parent_id,
            root_id: self.root_id,
        }
    }
}

/// Result returned by handler execution
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Completed successfully with a result payload
    Success(ValueContainer),
    /// Failed
    Failure {
        error: String,
        /// Whether the failure counts toward retry
        retryable: bool,
    },
    /// Handler requests an explicit retry
    Retry {
        reason: String,
        /// Overrides the policy delay when set
        countdown: Option<Duration>,
    },
}

/// Task handler: a name plus an execute entry point.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Handler name; tasks are routed to handlers by this name
    fn name(&self) -> &str;

    /// Execute one attempt of a task
    async fn execute(&self, ctx: TaskContext, payload: ValueContainer) -> TaskOutcome;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnTaskHandler {
    name: String,
    f: Box<dyn Fn(TaskContext, ValueContainer) -> BoxFuture<'static, TaskOutcome> + Send + Sync>,
}

impl FnTaskHandler {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext, ValueContainer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(move |ctx, payload| Box::pin(f(ctx, payload))),
        }
    }
}

#[async_trait]
impl TaskHandler for FnTaskHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: TaskContext, payload: ValueContainer) -> TaskOutcome {
        (self.f)(ctx, payload).await
    }
}

/// Registry of task handlers keyed by name
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler under its own name
    pub fn register<H: TaskHandler>(&self, handler: H) {
        let name = handler.name().to_string();
        tracing::debug!(handler = %name, "Registering task handler");
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Register an async closure under `name`
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(TaskContext, ValueContainer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        self.register(FnTaskHandler::new(name, f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).map(|r| r.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.handlers.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

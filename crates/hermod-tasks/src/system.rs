//! Task system façade wiring queue, backend, workers, scheduler, monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use hermod_bus::{Backend, BackendKind, Priority, StandaloneBackend, ValueContainer};

use crate::backend::{InMemoryResultBackend, ResultBackend};
use crate::client::TaskClient;
use crate::context::TaskContext;
use crate::error::{TaskError, TaskResult};
use crate::monitor::{EventDispatcher, Monitor};
use crate::queue::{TaskQueue, TaskQueueConfig};
use crate::result::AsyncResult;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::task::{HandlerRegistry, Task, TaskHandler, TaskId, TaskOutcome};
use crate::worker::{WorkerPool, WorkerPoolConfig};
use crate::workflow::{ChainResult, ChordResult, TaskSignature};

/// Top-level task system configuration
#[derive(Debug, Clone)]
pub struct TaskSystemConfig {
    pub queue: TaskQueueConfig,
    pub worker: WorkerPoolConfig,
    pub scheduler: SchedulerConfig,
    /// How often terminal records are swept
    pub cleanup_interval: Duration,
    /// Age past which terminal records are reclaimed
    pub result_max_age: Duration,
}

impl Default for TaskSystemConfig {
    fn default() -> Self {
        Self {
            queue: TaskQueueConfig::default(),
            worker: WorkerPoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            cleanup_interval: Duration::from_secs(300),
            result_max_age: Duration::from_secs(3600),
        }
    }
}

/// The task subsystem façade.
///
/// Owns the task queue, result backend, worker pool, scheduler and monitor.
/// With [`TaskSystem::new`] everything runs on a standalone backend; use
/// [`TaskSystem::with_backend`] to integrate with an external executor,
/// logger and metrics.
pub struct TaskSystem {
    config: TaskSystemConfig,
    backend: Arc<dyn Backend>,
    result_backend: Arc<dyn ResultBackend>,
    registry: Arc<HandlerRegistry>,
    queue: Arc<TaskQueue>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    monitor: Monitor,
    client: TaskClient,
    cleanup_shutdown: CancellationToken,
    running: AtomicBool,
}

impl TaskSystem {
    /// Build a standalone system with the in-memory result backend.
    pub fn new(config: TaskSystemConfig) -> Self {
        Self::with_backend(config, Arc::new(StandaloneBackend::new()))
    }

    /// Build a system with the backend kind taken from `HERMOD_BACKEND`.
    ///
    /// The integrated kind cannot be conjured from the environment; it
    /// needs its collaborators injected through [`TaskSystem::with_backend`].
    pub fn from_env(config: TaskSystemConfig) -> TaskResult<Self> {
        match BackendKind::from_env().map_err(|e| TaskError::Configuration(e.to_string()))? {
            BackendKind::Standalone => Ok(Self::new(config)),
            BackendKind::Integrated => Err(TaskError::Configuration(
                "integrated backend requires with_backend(...)".into(),
            )),
        }
    }

    /// Build a system on an externally supplied execution backend.
    pub fn with_backend(config: TaskSystemConfig, backend: Arc<dyn Backend>) -> Self {
        let result_backend: Arc<dyn ResultBackend> = Arc::new(InMemoryResultBackend::new());
        Self::assemble(config, backend, result_backend)
    }

    /// Build a system on external execution and result backends.
    pub fn with_backends(
        config: TaskSystemConfig,
        backend: Arc<dyn Backend>,
        result_backend: Arc<dyn ResultBackend>,
    ) -> Self {
        Self::assemble(config, backend, result_backend)
    }

    fn assemble(
        config: TaskSystemConfig,
        backend: Arc<dyn Backend>,
        result_backend: Arc<dyn ResultBackend>,
    ) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let queue = Arc::new(TaskQueue::new(config.queue.clone(), result_backend.clone()));
        let dispatcher = Arc::new(EventDispatcher::new());

        let pool = Arc::new(WorkerPool::new(
            config.worker.clone(),
            queue.clone(),
            result_backend.clone(),
            registry.clone(),
            backend.clone(),
            dispatcher.clone(),
        ));

        let client = TaskClient::new(
            queue.clone(),
            result_backend.clone(),
            backend.executor(),
            dispatcher.clone(),
        );
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), client.clone()));
        let monitor = Monitor::new(queue.clone(), pool.clone(), dispatcher);

        Self {
            config,
            backend,
            result_backend,
            registry,
            queue,
            pool,
            scheduler,
            monitor,
            client,
            cleanup_shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Start workers, delayed-task promotion, scheduler and maintenance.
    pub async fn start(&self) -> TaskResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.backend.is_ready() {
            self.backend
                .initialize()
                .await
                .map_err(|e| TaskError::Backend(e.to_string()))?;
        }
        self.result_backend.health_check().await?;

        let executor = self.backend.executor();
        self.queue.start(&executor);
        self.pool.start();
        self.scheduler.start(&executor);

        // Periodic sweep of aged-out terminal records.
        let result_backend = self.result_backend.clone();
        let interval = self.config.cleanup_interval;
        let max_age = self.config.result_max_age;
        let shutdown = self.cleanup_shutdown.clone();
        executor.spawn(Box::pin(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = result_backend.cleanup_expired(max_age).await {
                            tracing::warn!(error = %e, "Result cleanup failed");
                        }
                    }
                }
            }
        }));

        tracing::info!("Task system started");
        Ok(())
    }

    /// Stop: scheduler first, then workers (graceful), then the queue.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.scheduler.stop();
        self.pool.stop().await;
        self.queue.stop();
        self.cleanup_shutdown.cancel();
        if let Err(e) = self.backend.shutdown().await {
            tracing::warn!(error = %e, "Backend shutdown failed");
        }
        tracing::info!("Task system stopped");
    }

    /// Register a task handler
    pub fn register_handler<H: TaskHandler>(&self, handler: H) {
        self.registry.register(handler);
    }

    /// Register an async closure as a handler
    pub fn register_handler_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(TaskContext, ValueContainer) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskOutcome> + Send + 'static,
    {
        self.registry.register_fn(name, f);
    }

    /// Submit by handler name
    pub async fn submit(
        &self,
        name: impl Into<String>,
        payload: ValueContainer,
    ) -> TaskResult<AsyncResult> {
        self.client.submit(name, payload).await
    }

    /// Submit a fully built task
    pub async fn submit_task(&self, task: Task) -> TaskResult<AsyncResult> {
        self.client.submit_task(task).await
    }

    pub async fn submit_delayed(
        &self,
        name: impl Into<String>,
        payload: ValueContainer,
        delay: Duration,
    ) -> TaskResult<AsyncResult> {
        self.client.submit_delayed(name, payload, delay).await
    }

    pub async fn submit_with_priority(
        &self,
        name: impl Into<String>,
        payload: ValueContainer,
        priority: Priority,
    ) -> TaskResult<AsyncResult> {
        self.client.submit_with_priority(name, payload, priority).await
    }

    pub async fn chain(&self, signatures: Vec<TaskSignature>) -> TaskResult<ChainResult> {
        self.client.chain(signatures).await
    }

    pub async fn chord(
        &self,
        header: Vec<TaskSignature>,
        callback: TaskSignature,
    ) -> TaskResult<ChordResult> {
        self.client.chord(header, callback).await
    }

    pub async fn cancel(&self, id: &TaskId) -> TaskResult<bool> {
        self.client.cancel(id).await
    }

    pub async fn cancel_by_tag(&self, tag: &str) -> TaskResult<usize> {
        self.client.cancel_by_tag(tag).await
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn client(&self) -> TaskClient {
        self.client.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

//! Worker pool: pulls tasks, runs handlers, applies retry and timeout.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use hermod_bus::Backend;
use hermod_common::trace::{new_trace_id, with_trace_id};

use crate::backend::ResultBackend;
use crate::context::TaskContext;
use crate::error::TaskError;
use crate::monitor::{EventDispatcher, TaskEvent};
use crate::queue::TaskQueue;
use crate::state::TaskState;
use crate::task::{HandlerRegistry, Task, TaskOutcome};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Worker name prefix; workers are `<name>-0`, `<name>-1`, ...
    pub name: String,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Ordered queue names to pull from
    pub queues: Vec<String>,
    /// Dequeue timeout granularity
    pub poll_interval: Duration,
    /// Tasks a worker drains per wakeup before waiting again
    pub prefetch: usize,
    /// Result-backend health check interval
    pub heartbeat: Duration,
    /// Grace period for in-flight tasks at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            concurrency: num_cpus::get(),
            queues: vec!["default".to_string()],
            poll_interval: Duration::from_millis(100),
            prefetch: 4,
            heartbeat: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Per-worker counters
#[derive(Debug)]
pub struct WorkerStats {
    worker: String,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    skipped: AtomicU64,
    total_exec_ms: AtomicU64,
    max_exec_ms: AtomicU64,
}

impl WorkerStats {
    fn new(worker: String) -> Self {
        Self {
            worker,
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            total_exec_ms: AtomicU64::new(0),
            max_exec_ms: AtomicU64::new(0),
        }
    }

    fn record_execution(&self, ms: u64) {
        self.total_exec_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_exec_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStatsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total = self.total_exec_ms.load(Ordering::Relaxed);
        WorkerStatsSnapshot {
            worker: self.worker.clone(),
            tasks_processed: processed,
            tasks_succeeded: self.succeeded.load(Ordering::Relaxed),
            tasks_failed: self.failed.load(Ordering::Relaxed),
            tasks_retried: self.retried.load(Ordering::Relaxed),
            tasks_skipped: self.skipped.load(Ordering::Relaxed),
            avg_execution_ms: if processed == 0 {
                0.0
            } else {
                total as f64 / processed as f64
            },
            max_execution_ms: self.max_exec_ms.load(Ordering::Relaxed),
        }
    }
}

/// Plain-data snapshot of one worker's counters
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatsSnapshot {
    pub worker: String,
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_skipped: u64,
    pub avg_execution_ms: f64,
    pub max_execution_ms: u64,
}

/// Pool of workers executing tasks from the task queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<TaskQueue>,
    result_backend: Arc<dyn ResultBackend>,
    registry: Arc<HandlerRegistry>,
    backend: Arc<dyn Backend>,
    events: Arc<EventDispatcher>,
    stats: Vec<Arc<WorkerStats>>,
    shutdown: CancellationToken,
    force_cancel: CancellationToken,
    tracker: TaskTracker,
    running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<TaskQueue>,
        result_backend: Arc<dyn ResultBackend>,
        registry: Arc<HandlerRegistry>,
        backend: Arc<dyn Backend>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        let stats = (0..config.concurrency)
            .map(|i| Arc::new(WorkerStats::new(format!("{}-{}", config.name, i))))
            .collect();
        Self {
            config,
            queue,
            result_backend,
            registry,
            backend,
            events,
            stats,
            shutdown: CancellationToken::new(),
            force_cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Start the worker loops and the heartbeat.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let executor = self.backend.executor();

        for (idx, stats) in self.stats.iter().enumerate() {
            let pool = self.clone();
            let stats = stats.clone();
            let fut = self
                .tracker
                .track_future(async move { pool.worker_loop(idx, stats).await });
            executor.spawn(Box::pin(fut));
        }

        let pool = self.clone();
        executor.spawn(Box::pin(async move { pool.heartbeat_loop().await }));

        tracing::info!(
            pool = %self.config.name,
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "Worker pool started"
        );
    }

    /// Graceful shutdown: stop dequeuing, wait up to `shutdown_timeout`
    /// for in-flight tasks, then request cancellation on their contexts.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pool = %self.config.name,
                "In-flight tasks exceeded shutdown timeout; requesting cancellation"
            );
            self.force_cancel.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(1), self.tracker.wait()).await;
        }
        tracing::info!(pool = %self.config.name, "Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Per-worker counter snapshots
    pub fn worker_snapshots(&self) -> Vec<WorkerStatsSnapshot> {
        self.stats.iter().map(|s| s.snapshot()).collect()
    }

    async fn worker_loop(self: Arc<Self>, idx: usize, stats: Arc<WorkerStats>) {
        let worker_id = format!("{}-{}", self.config.name, idx);
        tracing::debug!(worker_id = %worker_id, "Worker started");
        self.events.dispatch_background(TaskEvent::WorkerOnline {
            worker: worker_id.clone(),
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.queue.dequeue(&self.config.queues, self.config.poll_interval) => {
                    match result {
                        Ok(task) => {
                            self.process_task(&worker_id, &stats, task).await;
                            // Drain a bounded burst before waiting again.
                            for _ in 1..self.config.prefetch {
                                if self.shutdown.is_cancelled() {
                                    break;
                                }
                                match self.queue.dequeue(&self.config.queues, Duration::ZERO).await {
                                    Ok(task) => self.process_task(&worker_id, &stats, task).await,
                                    Err(_) => break,
                                }
                            }
                        }
                        Err(TaskError::Timeout(_)) => {}
                        Err(TaskError::QueueStopped) => break,
                        Err(e) => {
                            tracing::error!(worker_id = %worker_id, error = %e, "Dequeue failed");
                            break;
                        }
                    }
                }
            }
        }

        self.events.dispatch_background(TaskEvent::WorkerOffline {
            worker: worker_id.clone(),
        });
        tracing::debug!(worker_id = %worker_id, "Worker stopped");
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.result_backend.health_check().await {
                        tracing::error!(pool = %self.config.name, error = %e, "Result backend health check failed");
                    }
                }
            }
        }
    }

    async fn process_task(&self, worker_id: &str, stats: &WorkerStats, task: Task) {
        let task_id = task.id.clone();
        let task_name = task.name.clone();

        // Cancelled while queued: skip without running.
        match self.result_backend.get_state(&task_id).await {
            Ok(Some(TaskState::Cancelled)) => {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                self.events.dispatch_background(TaskEvent::TaskCancelled {
                    task_id: task_id.clone(),
                });
                tracing::debug!(task_id = %task_id, "Skipping cancelled task");
                return;
            }
            Ok(Some(TaskState::Expired)) => {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            _ => {}
        }

        // Deadline passed while queued.
        if task.is_expired() {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self
                .result_backend
                .store_state(&task_id, TaskState::Expired)
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to expire task");
            }
            return;
        }

        let handler = match self.registry.get(&task_name) {
            Some(handler) => handler,
            None => {
                tracing::error!(task_id = %task_id, task_name = %task_name, "No handler registered");
                let _ = self
                    .result_backend
                    .mark_started(&task_id, worker_id)
                    .await;
                let _ = self
                    .result_backend
                    .store_error(
                        &task_id,
                        &format!("no handler registered for '{task_name}'"),
                        None,
                        None,
                    )
                    .await;
                stats.processed.fetch_add(1, Ordering::Relaxed);
                stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // Lost the race with a cancel: mark_started fails on the illegal
        // transition and the task is skipped.
        if self
            .result_backend
            .mark_started(&task_id, worker_id)
            .await
            .is_err()
        {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if task.retries > 0 {
            let _ = self.result_backend.set_retries(&task_id, task.retries).await;
        }

        self.events.dispatch_background(TaskEvent::TaskStarted {
            task_id: task_id.clone(),
            task_name: task_name.clone(),
            worker: worker_id.to_string(),
        });

        let ctx = TaskContext::new(
            &task,
            self.result_backend.clone(),
            self.queue.clone(),
            self.backend.logger(),
            self.force_cancel.child_token(),
        );

        tracing::info!(
            task_id = %task_id,
            task_name = %task_name,
            worker_id = %worker_id,
            attempt = task.retries,
            "Executing task"
        );

        let trace_id = task.trace_id.clone().unwrap_or_else(new_trace_id);
        let started = std::time::Instant::now();
        let payload = task.payload.clone();
        let timeout = task.config.timeout;

        let outcome = with_trace_id(trace_id, async {
            match timeout {
                Some(limit) => {
                    tokio::select! {
                        outcome = handler.execute(ctx, payload) => outcome,
                        _ = tokio::time::sleep(limit) => {
                            tracing::warn!(
                                task_id = %task_id,
                                task_name = %task_name,
                                timeout_ms = limit.as_millis() as u64,
                                "Task attempt exceeded timeout"
                            );
                            TaskOutcome::Failure {
                                error: format!("attempt exceeded timeout of {limit:?}"),
                                retryable: true,
                            }
                        }
                    }
                }
                None => handler.execute(ctx, payload).await,
            }
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        stats.record_execution(elapsed_ms);

        // Cancelled mid-run: the cancel already wrote the terminal state.
        if matches!(
            self.result_backend.get_state(&task_id).await,
            Ok(Some(TaskState::Cancelled))
        ) {
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            self.events.dispatch_background(TaskEvent::TaskCancelled {
                task_id: task_id.clone(),
            });
            return;
        }

        match outcome {
            TaskOutcome::Success(result) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self
                    .result_backend
                    .store_result(&task_id, result, Some(elapsed_ms))
                    .await
                {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to store result");
                    return;
                }
                stats.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    task_id = %task_id,
                    task_name = %task_name,
                    runtime_ms = elapsed_ms,
                    "Task succeeded"
                );
                self.events.dispatch_background(TaskEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    task_name: task_name.clone(),
                    success: true,
                    runtime: started.elapsed(),
                    worker: worker_id.to_string(),
                });
            }
            TaskOutcome::Failure { error, retryable } => {
                self.handle_failure(worker_id, stats, task, error, retryable, None, elapsed_ms)
                    .await;
            }
            TaskOutcome::Retry { reason, countdown } => {
                self.handle_failure(worker_id, stats, task, reason, true, countdown, elapsed_ms)
                    .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        worker_id: &str,
        stats: &WorkerStats,
        task: Task,
        error: String,
        retryable: bool,
        countdown: Option<Duration>,
        elapsed_ms: u64,
    ) {
        let task_id = task.id.clone();
        let task_name = task.name.clone();
        let attempt = task.retries;
        let policy = task.config.retry.clone();
        stats.processed.fetch_add(1, Ordering::Relaxed);

        if retryable && policy.should_retry(attempt) {
            let next_attempt = attempt + 1;
            let delay = countdown.unwrap_or_else(|| policy.delay_for_attempt(next_attempt));
            let eta = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d))
                .unwrap_or_else(Utc::now);

            tracing::warn!(
                task_id = %task_id,
                task_name = %task_name,
                attempt = next_attempt,
                max_retries = policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Task attempt failed; retrying"
            );

            if let Err(e) = self
                .result_backend
                .store_state(&task_id, TaskState::Retrying)
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "Retry transition rejected");
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let _ = self
                .result_backend
                .set_retries(&task_id, next_attempt)
                .await;

            match self.queue.enqueue(task.for_retry(eta)).await {
                Ok(_) => {
                    stats.retried.fetch_add(1, Ordering::Relaxed);
                    self.events.dispatch_background(TaskEvent::TaskRetried {
                        task_id,
                        task_name,
                        attempt: next_attempt,
                        next_run: eta,
                    });
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    let _ = self
                        .result_backend
                        .store_error(
                            &task_id,
                            &format!("{error} (re-enqueue failed: {e})"),
                            None,
                            Some(elapsed_ms),
                        )
                        .await;
                }
            }
        } else {
            tracing::warn!(
                task_id = %task_id,
                task_name = %task_name,
                retries = attempt,
                error = %error,
                "Task failed terminally"
            );
            if let Err(e) = self
                .result_backend
                .store_error(&task_id, &error, None, Some(elapsed_ms))
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to store error");
                return;
            }
            stats.failed.fetch_add(1, Ordering::Relaxed);
            self.events.dispatch_background(TaskEvent::TaskFailed {
                task_id: task_id.clone(),
                task_name: task_name.clone(),
                error,
                worker: worker_id.to_string(),
            });
            self.events.dispatch_background(TaskEvent::TaskCompleted {
                task_id,
                task_name,
                success: false,
                runtime: Duration::from_millis(elapsed_ms),
                worker: worker_id.to_string(),
            });
        }
    }
}

//! Task lifecycle events and monitoring.
//!
//! Workers emit [`TaskEvent`]s through an [`EventDispatcher`]; handlers run
//! in the background and never block a worker. The [`Monitor`] subscribes
//! its own collector to keep bounded samples of active and failed tasks and
//! exposes plain-data snapshots of queues and workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::queue::TaskQueue;
use crate::task::TaskId;
use crate::worker::{WorkerPool, WorkerStatsSnapshot};

/// Cap on the monitor's bounded sample lists
const SAMPLE_CAP: usize = 64;

/// Task lifecycle events
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task was accepted by the queue
    TaskSubmitted {
        task_id: TaskId,
        task_name: String,
        queue: String,
    },
    /// A worker began executing an attempt
    TaskStarted {
        task_id: TaskId,
        task_name: String,
        worker: String,
    },
    /// A task reached a terminal outcome
    TaskCompleted {
        task_id: TaskId,
        task_name: String,
        success: bool,
        runtime: Duration,
        worker: String,
    },
    /// A task failed terminally
    TaskFailed {
        task_id: TaskId,
        task_name: String,
        error: String,
        worker: String,
    },
    /// An attempt failed and the task was re-queued
    TaskRetried {
        task_id: TaskId,
        task_name: String,
        attempt: u32,
        next_run: DateTime<Utc>,
    },
    /// A task was cancelled
    TaskCancelled { task_id: TaskId },
    WorkerOnline { worker: String },
    WorkerOffline { worker: String },
}

/// Handler for lifecycle events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &TaskEvent);
}

/// Fan-out of lifecycle events to registered handlers.
pub struct EventDispatcher {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push(handler);
    }

    /// Invoke all handlers inline
    pub async fn dispatch(&self, event: &TaskEvent) {
        let handlers = {
            let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        for handler in handlers {
            handler.handle(event).await;
        }
    }

    /// Invoke all handlers on a background task so the caller never blocks
    pub fn dispatch_background(self: &Arc<Self>, event: TaskEvent) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(&event).await;
        });
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

struct FnEventHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&TaskEvent) + Send + Sync,
{
    async fn handle(&self, event: &TaskEvent) {
        (self.0)(event);
    }
}

/// One currently executing task
#[derive(Debug, Clone)]
pub struct ActiveTaskInfo {
    pub task_id: TaskId,
    pub task_name: String,
    pub worker: String,
    pub started_at: DateTime<Utc>,
}

/// One recorded failure
#[derive(Debug, Clone)]
pub struct FailureSample {
    pub task_id: TaskId,
    pub task_name: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

struct Collector {
    active: Arc<DashMap<TaskId, ActiveTaskInfo>>,
    failures: Arc<Mutex<VecDeque<FailureSample>>>,
}

#[async_trait]
impl EventHandler for Collector {
    async fn handle(&self, event: &TaskEvent) {
        match event {
            TaskEvent::TaskStarted {
                task_id,
                task_name,
                worker,
            } => {
                self.active.insert(
                    task_id.clone(),
                    ActiveTaskInfo {
                        task_id: task_id.clone(),
                        task_name: task_name.clone(),
                        worker: worker.clone(),
                        started_at: Utc::now(),
                    },
                );
            }
            TaskEvent::TaskCompleted { task_id, .. } | TaskEvent::TaskCancelled { task_id } => {
                self.active.remove(task_id);
            }
            TaskEvent::TaskFailed {
                task_id,
                task_name,
                error,
                ..
            } => {
                self.active.remove(task_id);
                let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
                if failures.len() >= SAMPLE_CAP {
                    failures.pop_front();
                }
                failures.push_back(FailureSample {
                    task_id: task_id.clone(),
                    task_name: task_name.clone(),
                    error: error.clone(),
                    at: Utc::now(),
                });
            }
            _ => {}
        }
    }
}

/// Read-side view over the task system.
pub struct Monitor {
    queue: Arc<TaskQueue>,
    pool: Arc<WorkerPool>,
    dispatcher: Arc<EventDispatcher>,
    active: Arc<DashMap<TaskId, ActiveTaskInfo>>,
    failures: Arc<Mutex<VecDeque<FailureSample>>>,
}

impl Monitor {
    pub fn new(
        queue: Arc<TaskQueue>,
        pool: Arc<WorkerPool>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let active = Arc::new(DashMap::new());
        let failures = Arc::new(Mutex::new(VecDeque::new()));
        dispatcher.add_handler(Arc::new(Collector {
            active: active.clone(),
            failures: failures.clone(),
        }));
        Self {
            queue,
            pool,
            dispatcher,
            active,
            failures,
        }
    }

    /// Register a handler for every lifecycle event
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.dispatcher.add_handler(handler);
    }

    pub fn on_task_started<F>(&self, f: F)
    where
        F: Fn(&TaskId, &str) + Send + Sync + 'static,
    {
        self.add_handler(Arc::new(FnEventHandler(move |event: &TaskEvent| {
            if let TaskEvent::TaskStarted {
                task_id, task_name, ..
            } = event
            {
                f(task_id, task_name);
            }
        })));
    }

    pub fn on_task_completed<F>(&self, f: F)
    where
        F: Fn(&TaskId, bool) + Send + Sync + 'static,
    {
        self.add_handler(Arc::new(FnEventHandler(move |event: &TaskEvent| {
            if let TaskEvent::TaskCompleted {
                task_id, success, ..
            } = event
            {
                f(task_id, *success);
            }
        })));
    }

    pub fn on_task_failed<F>(&self, f: F)
    where
        F: Fn(&TaskId, &str) + Send + Sync + 'static,
    {
        self.add_handler(Arc::new(FnEventHandler(move |event: &TaskEvent| {
            if let TaskEvent::TaskFailed { task_id, error, .. } = event {
                f(task_id, error);
            }
        })));
    }

    pub fn on_worker_offline<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.add_handler(Arc::new(FnEventHandler(move |event: &TaskEvent| {
            if let TaskEvent::WorkerOffline { worker } = event {
                f(worker);
            }
        })));
    }

    /// Pending-task counts per named queue
    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        self.queue.depths()
    }

    /// Tasks parked in the delayed queue
    pub fn delayed_count(&self) -> usize {
        self.queue.delayed_len()
    }

    /// Per-worker counters
    pub fn worker_snapshots(&self) -> Vec<WorkerStatsSnapshot> {
        self.pool.worker_snapshots()
    }

    /// Per-worker activity: whether each worker currently executes a task
    pub fn worker_activity(&self) -> Vec<(String, bool)> {
        let busy: std::collections::HashSet<String> = self
            .active
            .iter()
            .map(|e| e.value().worker.clone())
            .collect();
        self.pool
            .worker_snapshots()
            .into_iter()
            .map(|s| {
                let active = busy.contains(&s.worker);
                (s.worker, active)
            })
            .collect()
    }

    /// Currently executing tasks (bounded sample)
    pub fn active_tasks(&self) -> Vec<ActiveTaskInfo> {
        self.active
            .iter()
            .take(SAMPLE_CAP)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Recent terminal failures (bounded sample)
    pub fn recent_failures(&self) -> Vec<FailureSample> {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.iter().cloned().collect()
    }
}

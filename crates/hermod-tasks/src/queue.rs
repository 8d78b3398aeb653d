//! Multi-queue task storage with eta scheduling and cancellation.
//!
//! Named queues are created on demand, each bounded and (optionally)
//! priority-ordered. Tasks whose eta lies in the future park in a shared
//! delayed heap; a promotion loop moves them to their target queue once due,
//! waking early whenever a nearer eta arrives.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use hermod_bus::{Executor, Priority};

use crate::backend::ResultBackend;
use crate::error::{TaskError, TaskResult};
use crate::state::TaskState;
use crate::task::{Task, TaskId};

/// Task queue configuration
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Bound per named queue
    pub max_size: usize,
    /// Priority ordering inside each named queue
    pub priority_enabled: bool,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            priority_enabled: true,
        }
    }
}

impl TaskQueueConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_priority(mut self, enabled: bool) -> Self {
        self.priority_enabled = enabled;
        self
    }
}

struct PrioEntry {
    seq: u64,
    task: Task,
}

impl PartialEq for PrioEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PrioEntry {}

impl PartialOrd for PrioEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .config
            .priority
            .cmp(&other.task.config.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Store {
    Fifo(VecDeque<Task>),
    Prio(BinaryHeap<PrioEntry>),
}

impl Store {
    fn len(&self) -> usize {
        match self {
            Self::Fifo(q) => q.len(),
            Self::Prio(h) => h.len(),
        }
    }

    fn push(&mut self, task: Task, seq: u64) {
        match self {
            Self::Fifo(q) => q.push_back(task),
            Self::Prio(h) => h.push(PrioEntry { seq, task }),
        }
    }

    fn pop(&mut self) -> Option<Task> {
        match self {
            Self::Fifo(q) => q.pop_front(),
            Self::Prio(h) => h.pop().map(|e| e.task),
        }
    }

    fn head_priority(&self) -> Option<Priority> {
        match self {
            Self::Fifo(q) => q.front().map(|t| t.config.priority),
            Self::Prio(h) => h.peek().map(|e| e.task.config.priority),
        }
    }

    fn clear(&mut self) -> usize {
        let n = self.len();
        match self {
            Self::Fifo(q) => q.clear(),
            Self::Prio(h) => h.clear(),
        }
        n
    }
}

struct NamedQueue {
    store: Mutex<Store>,
    seq: AtomicU64,
}

impl NamedQueue {
    fn new(priority_enabled: bool) -> Self {
        let store = if priority_enabled {
            Store::Prio(BinaryHeap::new())
        } else {
            Store::Fifo(VecDeque::new())
        };
        Self {
            store: Mutex::new(store),
            seq: AtomicU64::new(0),
        }
    }

    fn push(&self, task: Task, max_size: usize) -> TaskResult<()> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        if store.len() >= max_size {
            return Err(TaskError::QueueFull(task.config.queue.clone()));
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        store.push(task, seq);
        Ok(())
    }

    fn pop(&self) -> Option<Task> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.pop()
    }

    fn head_priority(&self) -> Option<Priority> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.head_priority()
    }

    fn len(&self) -> usize {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.len()
    }

    fn clear(&self) -> usize {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.clear()
    }
}

struct DelayedEntry {
    eta: DateTime<Utc>,
    seq: u64,
    task: Task,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    // Max-heap popping the earliest eta first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .eta
            .cmp(&self.eta)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Multi-queue task registry with a shared delayed queue.
pub struct TaskQueue {
    config: TaskQueueConfig,
    backend: Arc<dyn ResultBackend>,
    queues: DashMap<String, Arc<NamedQueue>>,
    delayed: Mutex<BinaryHeap<DelayedEntry>>,
    delayed_seq: AtomicU64,
    work_notify: Notify,
    delayed_notify: Notify,
    tag_index: DashMap<String, Vec<TaskId>>,
    rr_cursor: AtomicUsize,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    expired_on_enqueue: AtomicU64,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig, backend: Arc<dyn ResultBackend>) -> Self {
        Self {
            config,
            backend,
            queues: DashMap::new(),
            delayed: Mutex::new(BinaryHeap::new()),
            delayed_seq: AtomicU64::new(0),
            work_notify: Notify::new(),
            delayed_notify: Notify::new(),
            tag_index: DashMap::new(),
            rr_cursor: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            expired_on_enqueue: AtomicU64::new(0),
        }
    }

    /// Start the delayed-task promotion loop on the given executor.
    pub fn start(self: &Arc<Self>, executor: &Arc<dyn Executor>) {
        let queue = self.clone();
        executor.spawn(Box::pin(async move { queue.promotion_loop().await }));
    }

    /// Enqueue a task, routing to the delayed queue when its eta lies in
    /// the future. Assigns `created_at`, seeds the result-backend record
    /// and checks the expiry deadline.
    pub async fn enqueue(&self, mut task: Task) -> TaskResult<TaskId> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TaskError::QueueStopped);
        }
        if task.name.is_empty() {
            return Err(TaskError::Configuration("task name is empty".into()));
        }

        let first_enqueue = task.created_at.is_none();
        if first_enqueue {
            task.created_at = Some(Utc::now());
            for tag in &task.config.tags {
                self.tag_index
                    .entry(tag.clone())
                    .or_default()
                    .push(task.id.clone());
            }
        }
        self.backend.init_record(&task).await?;

        let id = task.id.clone();

        if task.is_expired() {
            self.expired_on_enqueue.fetch_add(1, Ordering::Relaxed);
            if self.backend.get_state(&id).await? == Some(TaskState::Retrying) {
                // A retry that outlived its deadline fails terminally.
                self.backend
                    .store_error(&id, "task expired before retry attempt", None, None)
                    .await?;
            } else {
                self.backend.store_state(&id, TaskState::Expired).await?;
            }
            tracing::debug!(task_id = %id, task_name = %task.name, "Task expired at enqueue");
            return Ok(id);
        }

        self.backend.store_state(&id, TaskState::Queued).await?;
        task.state = TaskState::Queued;

        if !task.is_ready() {
            let eta = task.config.eta.unwrap_or_else(Utc::now);
            let seq = self.delayed_seq.fetch_add(1, Ordering::Relaxed);
            {
                let mut delayed = self.delayed.lock().unwrap_or_else(|e| e.into_inner());
                delayed.push(DelayedEntry { eta, seq, task });
            }
            // Wake the promotion loop in case this eta is now the earliest.
            self.delayed_notify.notify_one();
            tracing::debug!(task_id = %id, eta = %eta, "Task parked in delayed queue");
        } else {
            self.enqueue_named(task)?;
        }
        Ok(id)
    }

    fn enqueue_named(&self, task: Task) -> TaskResult<()> {
        let queue = self
            .queues
            .entry(task.config.queue.clone())
            .or_insert_with(|| Arc::new(NamedQueue::new(self.config.priority_enabled)))
            .clone();
        queue.push(task, self.config.max_size)?;
        self.work_notify.notify_one();
        Ok(())
    }

    /// Dequeue the highest-priority task across `queue_names`, waiting up
    /// to `timeout`. Ties between queues rotate round-robin.
    pub async fn dequeue(&self, queue_names: &[String], timeout: Duration) -> TaskResult<Task> {
        if queue_names.is_empty() {
            return Err(TaskError::Configuration("no queues requested".into()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_dequeue_any(queue_names) {
                // Cascade the wakeup while work remains.
                if queue_names.iter().any(|n| self.queue_len(n) > 0) {
                    self.work_notify.notify_one();
                }
                return Ok(task);
            }
            if self.stopped.load(Ordering::SeqCst) {
                return Err(TaskError::QueueStopped);
            }
            if Instant::now() >= deadline {
                return Err(TaskError::Timeout(format!(
                    "no task available within {timeout:?}"
                )));
            }
            let _ = tokio::time::timeout_at(deadline, self.work_notify.notified()).await;
        }
    }

    fn try_dequeue_any(&self, queue_names: &[String]) -> Option<Task> {
        let start = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % queue_names.len();

        let mut best: Option<(Priority, Arc<NamedQueue>)> = None;
        for offset in 0..queue_names.len() {
            let name = &queue_names[(start + offset) % queue_names.len()];
            let Some(queue) = self.queues.get(name).map(|q| q.clone()) else {
                continue;
            };
            if let Some(priority) = queue.head_priority() {
                let better = match &best {
                    Some((best_priority, _)) => priority > *best_priority,
                    None => true,
                };
                if better {
                    best = Some((priority, queue));
                }
            }
        }
        best.and_then(|(_, queue)| queue.pop())
    }

    /// Cancel one task; returns whether the cancel took effect.
    pub async fn cancel(&self, id: &TaskId) -> TaskResult<bool> {
        self.backend.try_cancel(id).await
    }

    /// Cancel every task carrying `tag`; returns how many were cancelled.
    pub async fn cancel_by_tag(&self, tag: &str) -> TaskResult<usize> {
        let Some((_, ids)) = self.tag_index.remove(tag) else {
            return Ok(0);
        };
        let mut cancelled = 0;
        for id in ids {
            if self.backend.try_cancel(&id).await? {
                cancelled += 1;
            }
        }
        tracing::info!(tag = %tag, cancelled, "Cancelled tasks by tag");
        Ok(cancelled)
    }

    /// Discard all queued tasks in a named queue
    pub fn purge(&self, queue_name: &str) -> usize {
        self.queues
            .get(queue_name)
            .map(|q| q.clear())
            .unwrap_or(0)
    }

    pub fn queue_len(&self, queue_name: &str) -> usize {
        self.queues.get(queue_name).map(|q| q.len()).unwrap_or(0)
    }

    /// Tasks parked in the delayed queue
    pub fn delayed_len(&self) -> usize {
        let delayed = self.delayed.lock().unwrap_or_else(|e| e.into_inner());
        delayed.len()
    }

    /// Names of all queues seen so far
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    /// Per-queue depths for monitoring
    pub fn depths(&self) -> Vec<(String, usize)> {
        self.queues
            .iter()
            .map(|e| (e.key().clone(), e.value().len()))
            .collect()
    }

    pub fn expired_on_enqueue(&self) -> u64 {
        self.expired_on_enqueue.load(Ordering::Relaxed)
    }

    /// Stop the queue: wake all blocked dequeues and halt promotion.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.work_notify.notify_waiters();
        self.delayed_notify.notify_waiters();
        tracing::debug!("Task queue stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn promotion_loop(self: Arc<Self>) {
        tracing::debug!("Delayed-task promotion loop started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let (due, next_eta) = {
                let mut delayed = self.delayed.lock().unwrap_or_else(|e| e.into_inner());
                let mut due = Vec::new();
                while delayed.peek().map(|e| e.eta <= now).unwrap_or(false) {
                    if let Some(entry) = delayed.pop() {
                        due.push(entry.task);
                    }
                }
                (due, delayed.peek().map(|e| e.eta))
            };

            for task in due {
                let id = task.id.clone();
                if let Err(e) = self.enqueue_named(task) {
                    tracing::warn!(task_id = %id, error = %e, "Promotion failed; task dropped to failed state");
                    let _ = self
                        .backend
                        .store_error(&id, &format!("promotion failed: {e}"), None, None)
                        .await;
                }
            }

            // Sleep until the earliest eta, or until a new task changes it.
            let sleep_for = match next_eta {
                Some(eta) => (eta - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(Duration::from_secs(60)),
                None => Duration::from_secs(60),
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.delayed_notify.notified() => {}
            }
        }
        tracing::debug!("Delayed-task promotion loop stopped");
    }
}

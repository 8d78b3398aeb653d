//! Result backend: task state, results, progress and checkpoints.
//!
//! The backend is the single source of truth for task lifecycle. Every
//! state transition a queue or worker performs is written through here and
//! validated against the state machine; terminal transitions wake any
//! `wait_for_result` callers. The in-memory implementation is canonical;
//! persistent stores plug in behind the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use hermod_bus::ValueContainer;

use crate::error::{TaskError, TaskResult};
use crate::state::TaskState;
use crate::task::{Task, TaskId};

/// Everything the backend knows about one task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub task_name: String,
    pub queue: String,
    pub state: TaskState,
    pub result: Option<ValueContainer>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub progress: f64,
    pub progress_message: Option<String>,
    pub checkpoint: Option<ValueContainer>,
    pub retries: u32,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub runtime_ms: Option<u64>,
    pub children: Vec<TaskId>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    fn new(task_id: TaskId, task_name: String, queue: String) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            task_name,
            queue,
            state: TaskState::Pending,
            result: None,
            error: None,
            traceback: None,
            progress: 0.0,
            progress_message: None,
            checkpoint: None,
            retries: 0,
            worker_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            runtime_ms: None,
            children: Vec::new(),
            updated_at: now,
        }
    }
}

/// Pluggable store of task outcomes.
#[async_trait]
pub trait ResultBackend: Send + Sync + 'static {
    /// Seed a record for a freshly built task
    async fn init_record(&self, task: &Task) -> TaskResult<()>;

    /// Transition a task's state, validating against the state machine.
    /// Writing the current state again is a no-op.
    async fn store_state(&self, id: &TaskId, state: TaskState) -> TaskResult<()>;

    /// Cancel if not yet terminal; returns whether the cancel took effect
    async fn try_cancel(&self, id: &TaskId) -> TaskResult<bool>;

    /// Record the start of an attempt (state Running, worker, started_at)
    async fn mark_started(&self, id: &TaskId, worker_id: &str) -> TaskResult<()>;

    /// Record success: state Succeeded plus the result payload
    async fn store_result(
        &self,
        id: &TaskId,
        result: ValueContainer,
        runtime_ms: Option<u64>,
    ) -> TaskResult<()>;

    /// Record terminal failure: state Failed plus the error
    async fn store_error(
        &self,
        id: &TaskId,
        error: &str,
        traceback: Option<&str>,
        runtime_ms: Option<u64>,
    ) -> TaskResult<()>;

    /// Record progress; `fraction` is clamped to [0, 1]
    async fn store_progress(
        &self,
        id: &TaskId,
        fraction: f64,
        message: Option<&str>,
    ) -> TaskResult<()>;

    /// Last-write-wins checkpoint, visible to later attempts
    async fn save_checkpoint(&self, id: &TaskId, checkpoint: ValueContainer) -> TaskResult<()>;

    async fn load_checkpoint(&self, id: &TaskId) -> TaskResult<Option<ValueContainer>>;

    async fn set_retries(&self, id: &TaskId, retries: u32) -> TaskResult<()>;

    /// Link a spawned sub-task to its parent
    async fn add_child(&self, parent: &TaskId, child: &TaskId) -> TaskResult<()>;

    async fn get_state(&self, id: &TaskId) -> TaskResult<Option<TaskState>>;

    async fn get_record(&self, id: &TaskId) -> TaskResult<Option<TaskRecord>>;

    /// Result payload, present only for succeeded tasks
    async fn get_result(&self, id: &TaskId) -> TaskResult<Option<ValueContainer>>;

    async fn get_progress(&self, id: &TaskId) -> TaskResult<Option<(f64, Option<String>)>>;

    /// Block until the task reaches a terminal state or the timeout
    /// elapses. Timing out returns an error and mutates nothing.
    async fn wait_for_result(&self, id: &TaskId, timeout: Duration) -> TaskResult<TaskRecord>;

    /// Drop terminal records untouched for longer than `max_age`;
    /// returns how many were reclaimed.
    async fn cleanup_expired(&self, max_age: Duration) -> TaskResult<usize>;

    async fn health_check(&self) -> TaskResult<()>;
}

/// Canonical in-memory result backend.
pub struct InMemoryResultBackend {
    records: DashMap<TaskId, TaskRecord>,
    waiters: DashMap<TaskId, Arc<Notify>>,
}

impl InMemoryResultBackend {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            waiters: DashMap::new(),
        }
    }

    /// Number of records currently held
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn waiter(&self, id: &TaskId) -> Arc<Notify> {
        self.waiters
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake(&self, id: &TaskId) {
        if let Some(notify) = self.waiters.get(id) {
            notify.notify_waiters();
        }
    }

    /// Apply `mutate` to the record, bumping `updated_at`.
    fn update<R>(
        &self,
        id: &TaskId,
        mutate: impl FnOnce(&mut TaskRecord) -> TaskResult<R>,
    ) -> TaskResult<R> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| TaskError::TaskNotFound(id.to_string()))?;
        let out = mutate(record.value_mut())?;
        record.updated_at = Utc::now();
        Ok(out)
    }

    fn transition(record: &mut TaskRecord, next: TaskState) -> TaskResult<bool> {
        if record.state == next {
            return Ok(false);
        }
        if !record.state.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                from: record.state,
                to: next,
            });
        }
        record.state = next;
        Ok(true)
    }
}

impl Default for InMemoryResultBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultBackend for InMemoryResultBackend {
    async fn init_record(&self, task: &Task) -> TaskResult<()> {
        self.records.entry(task.id.clone()).or_insert_with(|| {
            TaskRecord::new(
                task.id.clone(),
                task.name.clone(),
                task.config.queue.clone(),
            )
        });
        Ok(())
    }

    async fn store_state(&self, id: &TaskId, state: TaskState) -> TaskResult<()> {
        let changed = self.update(id, |record| Self::transition(record, state))?;
        if changed && state.is_terminal() {
            self.wake(id);
        }
        Ok(())
    }

    async fn try_cancel(&self, id: &TaskId) -> TaskResult<bool> {
        let cancelled = self.update(id, |record| {
            if record.state.is_terminal() {
                return Ok(false);
            }
            record.state = TaskState::Cancelled;
            record.completed_at = Some(Utc::now());
            Ok(true)
        })?;
        if cancelled {
            self.wake(id);
            tracing::debug!(task_id = %id, "Task cancelled");
        }
        Ok(cancelled)
    }

    async fn mark_started(&self, id: &TaskId, worker_id: &str) -> TaskResult<()> {
        self.update(id, |record| {
            Self::transition(record, TaskState::Running)?;
            record.worker_id = Some(worker_id.to_string());
            record.started_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn store_result(
        &self,
        id: &TaskId,
        result: ValueContainer,
        runtime_ms: Option<u64>,
    ) -> TaskResult<()> {
        self.update(id, |record| {
            Self::transition(record, TaskState::Succeeded)?;
            record.result = Some(result);
            record.completed_at = Some(Utc::now());
            record.runtime_ms = runtime_ms;
            Ok(())
        })?;
        self.wake(id);
        Ok(())
    }

    async fn store_error(
        &self,
        id: &TaskId,
        error: &str,
        traceback: Option<&str>,
        runtime_ms: Option<u64>,
    ) -> TaskResult<()> {
        self.update(id, |record| {
            Self::transition(record, TaskState::Failed)?;
            record.error = Some(error.to_string());
            record.traceback = traceback.map(str::to_string);
            record.completed_at = Some(Utc::now());
            record.runtime_ms = runtime_ms;
            Ok(())
        })?;
        self.wake(id);
        Ok(())
    }

    async fn store_progress(
        &self,
        id: &TaskId,
        fraction: f64,
        message: Option<&str>,
    ) -> TaskResult<()> {
        self.update(id, |record| {
            record.progress = fraction.clamp(0.0, 1.0);
            record.progress_message = message.map(str::to_string);
            Ok(())
        })
    }

    async fn save_checkpoint(&self, id: &TaskId, checkpoint: ValueContainer) -> TaskResult<()> {
        self.update(id, |record| {
            record.checkpoint = Some(checkpoint);
            Ok(())
        })
    }

    async fn load_checkpoint(&self, id: &TaskId) -> TaskResult<Option<ValueContainer>> {
        Ok(self
            .records
            .get(id)
            .and_then(|r| r.checkpoint.clone()))
    }

    async fn set_retries(&self, id: &TaskId, retries: u32) -> TaskResult<()> {
        self.update(id, |record| {
            record.retries = retries;
            Ok(())
        })
    }

    async fn add_child(&self, parent: &TaskId, child: &TaskId) -> TaskResult<()> {
        self.update(parent, |record| {
            record.children.push(child.clone());
            Ok(())
        })
    }

    async fn get_state(&self, id: &TaskId) -> TaskResult<Option<TaskState>> {
        Ok(self.records.get(id).map(|r| r.state))
    }

    async fn get_record(&self, id: &TaskId) -> TaskResult<Option<TaskRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn get_result(&self, id: &TaskId) -> TaskResult<Option<ValueContainer>> {
        Ok(self.records.get(id).and_then(|r| r.result.clone()))
    }

    async fn get_progress(&self, id: &TaskId) -> TaskResult<Option<(f64, Option<String>)>> {
        Ok(self
            .records
            .get(id)
            .map(|r| (r.progress, r.progress_message.clone())))
    }

    async fn wait_for_result(&self, id: &TaskId, timeout: Duration) -> TaskResult<TaskRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let notify = self.waiter(id);
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a terminal transition
            // between the check and the await cannot be missed.
            notified.as_mut().enable();

            if let Some(record) = self.records.get(id) {
                if record.state.is_terminal() {
                    return Ok(record.clone());
                }
            }

            if Instant::now() >= deadline {
                return Err(TaskError::Timeout(format!(
                    "task {id} did not complete within {timeout:?}"
                )));
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    async fn cleanup_expired(&self, max_age: Duration) -> TaskResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());

        let expired: Vec<TaskId> = self
            .records
            .iter()
            .filter(|r| r.state.is_terminal() && r.updated_at < cutoff)
            .map(|r| r.task_id.clone())
            .collect();

        let removed = expired.len();
        for id in expired {
            self.records.remove(&id);
            self.waiters.remove(&id);
        }
        if removed > 0 {
            tracing::debug!(removed, "Cleaned up expired task records");
        }
        Ok(removed)
    }

    async fn health_check(&self) -> TaskResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    async fn seeded(backend: &InMemoryResultBackend) -> TaskId {
        let task = Task::builder("demo").build();
        backend.init_record(&task).await.unwrap();
        let id = task.id.clone();
        backend.store_state(&id, TaskState::Queued).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_lifecycle_writes() {
        let backend = InMemoryResultBackend::new();
        let id = seeded(&backend).await;

        backend.mark_started(&id, "worker-1").await.unwrap();
        assert_eq!(
            backend.get_state(&id).await.unwrap(),
            Some(TaskState::Running)
        );

        backend
            .store_result(&id, ValueContainer::new().with("ok", true), Some(12))
            .await
            .unwrap();

        let record = backend.get_record(&id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Succeeded);
        assert_eq!(record.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(record.runtime_ms, Some(12));
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());
        assert_eq!(
            backend.get_result(&id).await.unwrap().unwrap().get_bool("ok"),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let backend = InMemoryResultBackend::new();
        let id = seeded(&backend).await;

        // Queued -> Succeeded skips Running
        let err = backend
            .store_result(&id, ValueContainer::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));

        // Same-state write is a no-op
        backend.store_state(&id, TaskState::Queued).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let backend = InMemoryResultBackend::new();
        let id = TaskId::new();
        assert!(backend.get_state(&id).await.unwrap().is_none());
        assert!(matches!(
            backend.store_state(&id, TaskState::Queued).await,
            Err(TaskError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_error_preserved_until_cleanup() {
        let backend = InMemoryResultBackend::new();
        let id = seeded(&backend).await;
        backend.mark_started(&id, "w").await.unwrap();
        backend
            .store_error(&id, "boom", Some("at line 3"), Some(5))
            .await
            .unwrap();

        let record = backend.get_record(&id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert_eq!(record.traceback.as_deref(), Some("at line 3"));

        // Too young to reclaim
        assert_eq!(
            backend.cleanup_expired(Duration::from_secs(60)).await.unwrap(),
            0
        );
        assert!(backend.get_record(&id).await.unwrap().is_some());

        // Old enough
        assert_eq!(
            backend.cleanup_expired(Duration::ZERO).await.unwrap(),
            1
        );
        assert!(backend.get_record(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_spares_active_tasks() {
        let backend = InMemoryResultBackend::new();
        let id = seeded(&backend).await;
        assert_eq!(backend.cleanup_expired(Duration::ZERO).await.unwrap(), 0);
        assert!(backend.get_record(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_try_cancel() {
        let backend = InMemoryResultBackend::new();
        let id = seeded(&backend).await;

        assert!(backend.try_cancel(&id).await.unwrap());
        assert_eq!(
            backend.get_state(&id).await.unwrap(),
            Some(TaskState::Cancelled)
        );
        // Second cancel is a no-op
        assert!(!backend.try_cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_progress_clamped() {
        let backend = InMemoryResultBackend::new();
        let id = seeded(&backend).await;

        backend.store_progress(&id, 1.7, Some("almost")).await.unwrap();
        let (fraction, message) = backend.get_progress(&id).await.unwrap().unwrap();
        assert_eq!(fraction, 1.0);
        assert_eq!(message.as_deref(), Some("almost"));

        backend.store_progress(&id, -0.5, None).await.unwrap();
        assert_eq!(backend.get_progress(&id).await.unwrap().unwrap().0, 0.0);
    }

    #[tokio::test]
    async fn test_checkpoint_last_write_wins() {
        let backend = InMemoryResultBackend::new();
        let id = seeded(&backend).await;

        assert!(backend.load_checkpoint(&id).await.unwrap().is_none());
        backend
            .save_checkpoint(&id, ValueContainer::new().with("cursor", 10i64))
            .await
            .unwrap();
        backend
            .save_checkpoint(&id, ValueContainer::new().with("cursor", 20i64))
            .await
            .unwrap();

        let checkpoint = backend.load_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(checkpoint.get_i64("cursor"), Some(20));
    }

    #[tokio::test]
    async fn test_wait_for_result_timeout() {
        let backend = InMemoryResultBackend::new();
        let id = seeded(&backend).await;

        let err = backend
            .wait_for_result(&id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Timeout(_)));
        // Timing out mutated nothing
        assert_eq!(
            backend.get_state(&id).await.unwrap(),
            Some(TaskState::Queued)
        );
    }

    #[tokio::test]
    async fn test_wait_for_result_wakes_on_terminal() {
        let backend = Arc::new(InMemoryResultBackend::new());
        let id = seeded(&backend).await;

        let waiter_backend = backend.clone();
        let waiter_id = id.clone();
        let waiter = tokio::spawn(async move {
            waiter_backend
                .wait_for_result(&waiter_id, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.mark_started(&id, "w").await.unwrap();
        backend
            .store_result(&id, ValueContainer::new().with("n", 1i64), None)
            .await
            .unwrap();

        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_wait_for_result_on_not_yet_created_task() {
        // A waiter may start before the record exists (workflow callbacks).
        let backend = Arc::new(InMemoryResultBackend::new());
        let id = TaskId::new();

        let waiter_backend = backend.clone();
        let waiter_id = id.clone();
        let waiter = tokio::spawn(async move {
            waiter_backend
                .wait_for_result(&waiter_id, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut task = Task::builder("late").build();
        task.id = id.clone();
        backend.init_record(&task).await.unwrap();
        backend.store_state(&id, TaskState::Queued).await.unwrap();
        backend.mark_started(&id, "w").await.unwrap();
        backend
            .store_result(&id, ValueContainer::new(), None)
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap().unwrap().state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_children_links() {
        let backend = InMemoryResultBackend::new();
        let parent = seeded(&backend).await;
        let child = TaskId::new();

        backend.add_child(&parent, &child).await.unwrap();
        let record = backend.get_record(&parent).await.unwrap().unwrap();
        assert_eq!(record.children, vec![child]);
    }
}

//! Execution context handed to task handlers.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use hermod_bus::{LogLevel, LogSink, ValueContainer};

use crate::backend::ResultBackend;
use crate::error::TaskResult;
use crate::queue::TaskQueue;
use crate::state::TaskState;
use crate::task::{Task, TaskId};

/// Handle given to a handler for the duration of one attempt.
///
/// Progress, checkpoints and cancellation all flow through the result
/// backend, so they survive retries and are visible to observers holding
/// the task id.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_name: String,
    pub queue: String,
    /// Retry count of the current attempt (0 for the first)
    pub attempt: u32,
    pub max_retries: u32,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub parent_id: Option<TaskId>,
    pub root_id: Option<TaskId>,
    backend: Arc<dyn ResultBackend>,
    task_queue: Arc<TaskQueue>,
    log_sink: Option<Arc<dyn LogSink>>,
    force_cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(
        task: &Task,
        backend: Arc<dyn ResultBackend>,
        task_queue: Arc<TaskQueue>,
        log_sink: Option<Arc<dyn LogSink>>,
        force_cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            queue: task.config.queue.clone(),
            attempt: task.retries,
            max_retries: task.config.retry.max_retries,
            correlation_id: task.correlation_id.clone(),
            trace_id: task.trace_id.clone(),
            parent_id: task.parent_id.clone(),
            root_id: task.root_id.clone(),
            backend,
            task_queue,
            log_sink,
            force_cancel,
        }
    }

    /// Report progress; `fraction` is clamped to `[0, 1]`.
    pub async fn update_progress(&self, fraction: f64, message: Option<&str>) -> TaskResult<()> {
        self.backend
            .store_progress(&self.task_id, fraction.clamp(0.0, 1.0), message)
            .await
    }

    /// Persist a checkpoint; the latest one is visible to later attempts.
    pub async fn save_checkpoint(&self, checkpoint: ValueContainer) -> TaskResult<()> {
        self.backend
            .save_checkpoint(&self.task_id, checkpoint)
            .await
    }

    /// Load the most recent checkpoint, if any.
    pub async fn load_checkpoint(&self) -> TaskResult<Option<ValueContainer>> {
        self.backend.load_checkpoint(&self.task_id).await
    }

    /// Enqueue a sub-task linked to this one.
    ///
    /// The sub-task inherits this task as parent, shares its workflow root
    /// and its trace id unless already set.
    pub async fn spawn_subtask(&self, mut task: Task) -> TaskResult<TaskId> {
        task.parent_id = Some(self.task_id.clone());
        task.root_id = Some(
            self.root_id
                .clone()
                .unwrap_or_else(|| self.task_id.clone()),
        );
        if task.trace_id.is_none() {
            task.trace_id = self.trace_id.clone();
        }

        let child_id = self.task_queue.enqueue(task).await?;
        self.backend.add_child(&self.task_id, &child_id).await?;
        tracing::debug!(
            task_id = %self.task_id,
            child_id = %child_id,
            "Spawned sub-task"
        );
        Ok(child_id)
    }

    /// Whether cancellation has been requested for this task.
    ///
    /// Cooperative: handlers are expected to poll this and return early.
    pub async fn is_cancelled(&self) -> bool {
        if self.force_cancel.is_cancelled() {
            return true;
        }
        matches!(
            self.backend.get_state(&self.task_id).await,
            Ok(Some(TaskState::Cancelled))
        )
    }

    pub fn log_debug(&self, message: &str) {
        tracing::debug!(task_id = %self.task_id, task = %self.task_name, "{message}");
        self.forward(LogLevel::Debug, message);
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(task_id = %self.task_id, task = %self.task_name, "{message}");
        self.forward(LogLevel::Info, message);
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(task_id = %self.task_id, task = %self.task_name, "{message}");
        self.forward(LogLevel::Warn, message);
    }

    pub fn log_error(&self, message: &str) {
        tracing::error!(task_id = %self.task_id, task = %self.task_name, "{message}");
        self.forward(LogLevel::Error, message);
    }

    fn forward(&self, level: LogLevel, message: &str) {
        if let Some(sink) = &self.log_sink {
            let message = match &self.trace_id {
                Some(trace) => format!("[{trace}] {message}"),
                None => message.to_string(),
            };
            sink.log(level, &self.task_name, &message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryResultBackend;
    use crate::queue::TaskQueueConfig;
    use crate::task::Task;
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryResultBackend>, Arc<TaskQueue>) {
        let backend = Arc::new(InMemoryResultBackend::new());
        let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default(), backend.clone()));
        (backend, queue)
    }

    async fn context_for(
        backend: &Arc<InMemoryResultBackend>,
        queue: &Arc<TaskQueue>,
    ) -> (Task, TaskContext) {
        let task = Task::builder("ctx-test").trace_id("trace-1").build();
        backend.init_record(&task).await.unwrap();
        backend
            .store_state(&task.id, TaskState::Queued)
            .await
            .unwrap();
        let backend_dyn: Arc<dyn ResultBackend> = backend.clone();
        let ctx = TaskContext::new(
            &task,
            backend_dyn,
            queue.clone(),
            None,
            CancellationToken::new(),
        );
        (task, ctx)
    }

    #[tokio::test]
    async fn test_progress_write_through() {
        let (backend, queue) = setup();
        let (task, ctx) = context_for(&backend, &queue).await;

        ctx.update_progress(0.5, Some("halfway")).await.unwrap();
        let (fraction, message) = backend.get_progress(&task.id).await.unwrap().unwrap();
        assert_eq!(fraction, 0.5);
        assert_eq!(message.as_deref(), Some("halfway"));

        // Clamping
        ctx.update_progress(7.0, None).await.unwrap();
        assert_eq!(backend.get_progress(&task.id).await.unwrap().unwrap().0, 1.0);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let (backend, queue) = setup();
        let (_task, ctx) = context_for(&backend, &queue).await;

        assert!(ctx.load_checkpoint().await.unwrap().is_none());
        ctx.save_checkpoint(ValueContainer::new().with("offset", 42i64))
            .await
            .unwrap();
        assert_eq!(
            ctx.load_checkpoint().await.unwrap().unwrap().get_i64("offset"),
            Some(42)
        );
    }

    #[tokio::test]
    async fn test_spawn_subtask_links_parent() {
        let (backend, queue) = setup();
        let (task, ctx) = context_for(&backend, &queue).await;

        let child_id = ctx
            .spawn_subtask(Task::builder("child").build())
            .await
            .unwrap();

        let parent_record = backend.get_record(&task.id).await.unwrap().unwrap();
        assert_eq!(parent_record.children, vec![child_id.clone()]);

        let child = queue
            .dequeue(&["default".to_string()], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(child.id, child_id);
        assert_eq!(child.parent_id, Some(task.id.clone()));
        assert_eq!(child.root_id, Some(task.id.clone()));
        assert_eq!(child.trace_id.as_deref(), Some("trace-1"));
    }

    #[tokio::test]
    async fn test_is_cancelled_tracks_backend() {
        let (backend, queue) = setup();
        let (task, ctx) = context_for(&backend, &queue).await;

        assert!(!ctx.is_cancelled().await);
        backend.try_cancel(&task.id).await.unwrap();
        assert!(ctx.is_cancelled().await);
    }

    #[tokio::test]
    async fn test_is_cancelled_tracks_force_token() {
        let (backend, queue) = setup();
        let task = Task::builder("t").build();
        backend.init_record(&task).await.unwrap();
        let token = CancellationToken::new();
        let backend_dyn: Arc<dyn ResultBackend> = backend.clone();
        let ctx = TaskContext::new(&task, backend_dyn, queue, None, token.clone());

        assert!(!ctx.is_cancelled().await);
        token.cancel();
        assert!(ctx.is_cancelled().await);
    }
}

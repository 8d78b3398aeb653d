//! Client-facing handle to a task's eventual outcome.

use std::sync::Arc;
use std::time::Duration;

use hermod_bus::{Executor, ValueContainer};

use crate::backend::{ResultBackend, TaskRecord};
use crate::error::{TaskError, TaskResult};
use crate::queue::TaskQueue;
use crate::state::TaskState;
use crate::task::TaskId;

/// Handle returned by task submission.
///
/// Holds the task id plus borrowed (reference-counted) access to the result
/// backend and queue; it owns no task data itself, so handles can be cloned
/// and dropped freely without affecting the task.
#[derive(Clone)]
pub struct AsyncResult {
    task_id: TaskId,
    backend: Arc<dyn ResultBackend>,
    queue: Arc<TaskQueue>,
    executor: Arc<dyn Executor>,
}

impl AsyncResult {
    pub(crate) fn new(
        task_id: TaskId,
        backend: Arc<dyn ResultBackend>,
        queue: Arc<TaskQueue>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            task_id,
            backend,
            queue,
            executor,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Current state, if the backend still holds the task
    pub async fn state(&self) -> TaskResult<Option<TaskState>> {
        self.backend.get_state(&self.task_id).await
    }

    /// Whether the task has reached a terminal state
    pub async fn is_ready(&self) -> bool {
        matches!(self.state().await, Ok(Some(state)) if state.is_terminal())
    }

    pub async fn is_successful(&self) -> bool {
        matches!(self.state().await, Ok(Some(TaskState::Succeeded)))
    }

    pub async fn is_failed(&self) -> bool {
        matches!(
            self.state().await,
            Ok(Some(TaskState::Failed | TaskState::Cancelled | TaskState::Expired))
        )
    }

    /// Progress fraction in [0, 1]
    pub async fn progress(&self) -> TaskResult<f64> {
        Ok(self
            .backend
            .get_progress(&self.task_id)
            .await?
            .map(|(fraction, _)| fraction)
            .unwrap_or(0.0))
    }

    pub async fn progress_message(&self) -> TaskResult<Option<String>> {
        Ok(self
            .backend
            .get_progress(&self.task_id)
            .await?
            .and_then(|(_, message)| message))
    }

    /// Await the result payload.
    ///
    /// Returns the payload only when the task succeeded; a failure record
    /// or timeout becomes the corresponding error.
    pub async fn get(&self, timeout: Duration) -> TaskResult<ValueContainer> {
        let record = self.backend.wait_for_result(&self.task_id, timeout).await?;
        Self::unpack(record)
    }

    fn unpack(record: TaskRecord) -> TaskResult<ValueContainer> {
        match record.state {
            TaskState::Succeeded => record.result.ok_or_else(|| {
                TaskError::Internal(format!(
                    "task {} succeeded but holds no result",
                    record.task_id
                ))
            }),
            TaskState::Failed => Err(TaskError::ExecutionFailed(
                record.error.unwrap_or_else(|| "task failed".to_string()),
            )),
            TaskState::Cancelled => Err(TaskError::Cancelled(record.task_id.to_string())),
            TaskState::Expired => Err(TaskError::Expired(record.task_id.to_string())),
            other => Err(TaskError::Internal(format!(
                "wait returned non-terminal state {other}"
            ))),
        }
    }

    /// Register callbacks invoked on the backend executor once the task is
    /// terminal.
    pub fn then<S, F>(&self, on_success: S, on_failure: Option<F>)
    where
        S: FnOnce(ValueContainer) + Send + 'static,
        F: FnOnce(TaskError) + Send + 'static,
    {
        let backend = self.backend.clone();
        let task_id = self.task_id.clone();
        self.executor.spawn(Box::pin(async move {
            let record = loop {
                match backend.wait_for_result(&task_id, Duration::from_secs(60)).await {
                    Ok(record) => break record,
                    Err(TaskError::Timeout(_)) => continue,
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "then() wait failed");
                        if let Some(on_failure) = on_failure {
                            on_failure(e);
                        }
                        return;
                    }
                }
            };
            match Self::unpack(record) {
                Ok(payload) => on_success(payload),
                Err(e) => {
                    if let Some(on_failure) = on_failure {
                        on_failure(e);
                    }
                }
            }
        }));
    }

    /// Cancel the task; returns whether the cancel took effect.
    pub async fn revoke(&self) -> TaskResult<bool> {
        self.queue.cancel(&self.task_id).await
    }

    /// Handles to the sub-tasks spawned by this task so far
    pub async fn children(&self) -> TaskResult<Vec<AsyncResult>> {
        let record = self
            .backend
            .get_record(&self.task_id)
            .await?
            .ok_or_else(|| TaskError::TaskNotFound(self.task_id.to_string()))?;
        Ok(record
            .children
            .into_iter()
            .map(|child_id| {
                AsyncResult::new(
                    child_id,
                    self.backend.clone(),
                    self.queue.clone(),
                    self.executor.clone(),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryResultBackend;
    use crate::queue::TaskQueueConfig;
    use crate::task::Task;
    use hermod_bus::TokioExecutor;

    struct Fixture {
        backend: Arc<InMemoryResultBackend>,
        result: AsyncResult,
        task_id: TaskId,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryResultBackend::new());
        let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default(), backend.clone()));
        let task = Task::builder("r").build();
        backend.init_record(&task).await.unwrap();
        backend
            .store_state(&task.id, TaskState::Queued)
            .await
            .unwrap();
        let result = AsyncResult::new(
            task.id.clone(),
            backend.clone(),
            queue,
            Arc::new(TokioExecutor),
        );
        Fixture {
            backend,
            result,
            task_id: task.id,
        }
    }

    #[tokio::test]
    async fn test_get_success_payload() {
        let f = fixture().await;
        f.backend.mark_started(&f.task_id, "w").await.unwrap();
        f.backend
            .store_result(&f.task_id, ValueContainer::new().with("n", 5i64), None)
            .await
            .unwrap();

        assert!(f.result.is_ready().await);
        assert!(f.result.is_successful().await);
        assert!(!f.result.is_failed().await);
        let payload = f.result.get(Duration::from_millis(100)).await.unwrap();
        assert_eq!(payload.get_i64("n"), Some(5));
    }

    #[tokio::test]
    async fn test_get_failure() {
        let f = fixture().await;
        f.backend.mark_started(&f.task_id, "w").await.unwrap();
        f.backend
            .store_error(&f.task_id, "boom", None, None)
            .await
            .unwrap();

        assert!(f.result.is_failed().await);
        let err = f.result.get(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, TaskError::ExecutionFailed(msg) if msg == "boom"));
    }

    #[tokio::test]
    async fn test_get_timeout() {
        let f = fixture().await;
        let err = f.result.get(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TaskError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_revoke() {
        let f = fixture().await;
        assert!(f.result.revoke().await.unwrap());
        let err = f.result.get(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_progress_view() {
        let f = fixture().await;
        f.backend
            .store_progress(&f.task_id, 0.25, Some("warming up"))
            .await
            .unwrap();
        assert_eq!(f.result.progress().await.unwrap(), 0.25);
        assert_eq!(
            f.result.progress_message().await.unwrap().as_deref(),
            Some("warming up")
        );
    }

    #[tokio::test]
    async fn test_then_callback_on_success() {
        let f = fixture().await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        f.result.then(
            move |payload| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(payload.get_i64("n"));
                }
            },
            None::<fn(TaskError)>,
        );

        f.backend.mark_started(&f.task_id, "w").await.unwrap();
        f.backend
            .store_result(&f.task_id, ValueContainer::new().with("n", 9i64), None)
            .await
            .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(9));
    }

    #[tokio::test]
    async fn test_children() {
        let f = fixture().await;
        let child = TaskId::new();
        f.backend.add_child(&f.task_id, &child).await.unwrap();

        let children = f.result.children().await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].task_id(), &child);
    }
}

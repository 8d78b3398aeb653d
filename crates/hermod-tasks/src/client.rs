//! Task client: the producer-side handle for submitting work.

use std::sync::Arc;
use std::time::Duration;

use hermod_bus::{Executor, Priority, ValueContainer};
use hermod_common::trace::current_trace_id;

use crate::backend::ResultBackend;
use crate::error::TaskResult;
use crate::monitor::{EventDispatcher, TaskEvent};
use crate::queue::TaskQueue;
use crate::result::AsyncResult;
use crate::task::{Task, TaskId};
use crate::workflow::{Chain, ChainResult, Chord, ChordResult, TaskSignature};

/// Cheap, cloneable producer handle over the task queue and result backend.
#[derive(Clone)]
pub struct TaskClient {
    queue: Arc<TaskQueue>,
    backend: Arc<dyn ResultBackend>,
    executor: Arc<dyn Executor>,
    events: Arc<EventDispatcher>,
}

impl TaskClient {
    pub(crate) fn new(
        queue: Arc<TaskQueue>,
        backend: Arc<dyn ResultBackend>,
        executor: Arc<dyn Executor>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            queue,
            backend,
            executor,
            events,
        }
    }

    /// Submit a fully built task.
    ///
    /// Captures the ambient trace id if the task has none.
    pub async fn submit_task(&self, mut task: Task) -> TaskResult<AsyncResult> {
        if task.trace_id.is_none() {
            task.trace_id = current_trace_id();
        }
        let task_name = task.name.clone();
        let queue_name = task.config.queue.clone();

        let id = self.queue.enqueue(task).await?;
        self.events.dispatch_background(TaskEvent::TaskSubmitted {
            task_id: id.clone(),
            task_name,
            queue: queue_name,
        });
        Ok(self.result_for(id))
    }

    /// Submit by handler name with a payload and default configuration
    pub async fn submit(
        &self,
        name: impl Into<String>,
        payload: ValueContainer,
    ) -> TaskResult<AsyncResult> {
        self.submit_task(Task::builder(name).payload(payload).build())
            .await
    }

    /// Submit with a relative execution delay
    pub async fn submit_delayed(
        &self,
        name: impl Into<String>,
        payload: ValueContainer,
        delay: Duration,
    ) -> TaskResult<AsyncResult> {
        self.submit_task(Task::builder(name).payload(payload).delay(delay).build())
            .await
    }

    /// Submit with an explicit priority
    pub async fn submit_with_priority(
        &self,
        name: impl Into<String>,
        payload: ValueContainer,
        priority: Priority,
    ) -> TaskResult<AsyncResult> {
        self.submit_task(
            Task::builder(name)
                .payload(payload)
                .priority(priority)
                .build(),
        )
        .await
    }

    /// Run signatures sequentially, feeding each result to the next
    pub async fn chain(&self, signatures: Vec<TaskSignature>) -> TaskResult<ChainResult> {
        Chain::new(signatures).apply(self).await
    }

    /// Run a parallel header then a callback over all header results
    pub async fn chord(
        &self,
        header: Vec<TaskSignature>,
        callback: TaskSignature,
    ) -> TaskResult<ChordResult> {
        Chord::new(header, callback).apply(self).await
    }

    /// Cancel one task
    pub async fn cancel(&self, id: &TaskId) -> TaskResult<bool> {
        self.queue.cancel(id).await
    }

    /// Cancel every task carrying `tag`
    pub async fn cancel_by_tag(&self, tag: &str) -> TaskResult<usize> {
        self.queue.cancel_by_tag(tag).await
    }

    /// Handle for an already submitted task id
    pub fn result_for(&self, id: TaskId) -> AsyncResult {
        AsyncResult::new(
            id,
            self.backend.clone(),
            self.queue.clone(),
            self.executor.clone(),
        )
    }

    pub(crate) fn backend(&self) -> &Arc<dyn ResultBackend> {
        &self.backend
    }

    pub(crate) fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }
}

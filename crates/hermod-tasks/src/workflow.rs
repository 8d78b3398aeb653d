//! Task composition: chains and chords.
//!
//! A [`Chain`] runs signatures sequentially, merging each result into the
//! next task's payload under the `"previous_result"` key. A [`Chord`] runs
//! its header signatures in parallel and, once all of them succeed, submits
//! a callback whose payload carries the collected results.
//!
//! Both drivers run as background futures on the client's executor; the
//! returned handles observe progress purely through task ids and the
//! result backend.

use std::sync::Arc;
use std::time::Duration;

use hermod_bus::{Priority, ValueContainer};

use crate::backend::ResultBackend;
use crate::client::TaskClient;
use crate::error::{TaskError, TaskResult};
use crate::result::AsyncResult;
use crate::state::TaskState;
use crate::task::{Task, TaskBuilder, TaskId};

/// Payload key under which a chain feeds the previous task's result
pub const PREVIOUS_RESULT_KEY: &str = "previous_result";
/// Payload key under which a chord callback receives the header results
pub const HEADER_RESULTS_KEY: &str = "header_results";

/// A task invocation template used by workflows and schedules.
#[derive(Debug, Clone)]
pub struct TaskSignature {
    pub task_name: String,
    pub payload: ValueContainer,
    pub queue: Option<String>,
    pub priority: Option<Priority>,
}

impl TaskSignature {
    pub fn new(task_name: impl Into<String>, payload: ValueContainer) -> Self {
        Self {
            task_name: task_name.into(),
            payload,
            queue: None,
            priority: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Instantiate a task (fresh id) from this signature
    pub fn into_task(self) -> Task {
        let mut builder = TaskBuilder::new(self.task_name).payload(self.payload);
        if let Some(queue) = self.queue {
            builder = builder.queue(queue);
        }
        if let Some(priority) = self.priority {
            builder = builder.priority(priority);
        }
        builder.build()
    }
}

/// Sequential workflow of task signatures.
#[derive(Debug, Clone)]
pub struct Chain {
    signatures: Vec<TaskSignature>,
}

impl Chain {
    pub fn new(signatures: Vec<TaskSignature>) -> Self {
        Self { signatures }
    }

    /// Submit the chain. The first link is enqueued immediately; a driver
    /// submits each following link when its predecessor succeeds.
    pub async fn apply(self, client: &TaskClient) -> TaskResult<ChainResult> {
        if self.signatures.is_empty() {
            return Err(TaskError::InvalidWorkflow(
                "chain must have at least one task".to_string(),
            ));
        }

        // Build all links up front so their ids are known to the handle.
        let mut tasks: Vec<Task> = self
            .signatures
            .into_iter()
            .map(TaskSignature::into_task)
            .collect();
        let root_id = tasks[0].id.clone();
        for i in 1..tasks.len() {
            let parent = tasks[i - 1].id.clone();
            tasks[i].parent_id = Some(parent);
            tasks[i].root_id = Some(root_id.clone());
        }

        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        let results: Vec<AsyncResult> = task_ids
            .iter()
            .map(|id| client.result_for(id.clone()))
            .collect();

        let mut iter = tasks.into_iter();
        let first = iter.next().expect("chain checked non-empty");
        client.submit_task(first).await?;

        let remaining: Vec<Task> = iter.collect();
        if !remaining.is_empty() {
            let driver_client = client.clone();
            let driver_ids = task_ids.clone();
            client.executor().spawn(Box::pin(async move {
                drive_chain(driver_client, driver_ids, remaining).await;
            }));
        }

        Ok(ChainResult { results })
    }
}

async fn drive_chain(client: TaskClient, task_ids: Vec<TaskId>, remaining: Vec<Task>) {
    let backend = client.backend().clone();
    let mut prev_id = task_ids[0].clone();

    for mut task in remaining {
        let record = match wait_terminal(&backend, &prev_id).await {
            Some(record) => record,
            None => return,
        };
        if record.state != TaskState::Succeeded {
            tracing::debug!(
                chain_root = %task_ids[0],
                failed_link = %prev_id,
                state = %record.state,
                "Chain stopped at failed link"
            );
            return;
        }

        if let Some(result) = record.result {
            task.payload.set(PREVIOUS_RESULT_KEY, result);
        }
        prev_id = task.id.clone();
        if let Err(e) = client.submit_task(task).await {
            tracing::warn!(chain_root = %task_ids[0], error = %e, "Chain link submission failed");
            return;
        }
    }
}

/// Handle to a running chain.
#[derive(Clone)]
pub struct ChainResult {
    results: Vec<AsyncResult>,
}

impl ChainResult {
    /// Per-link handles, in chain order
    pub fn links(&self) -> &[AsyncResult] {
        &self.results
    }

    pub fn last_task_id(&self) -> &TaskId {
        self.results
            .last()
            .expect("chain is non-empty")
            .task_id()
    }

    /// Wait for the final link's payload, surfacing the first failed
    /// link's error instead if the chain broke.
    pub async fn get(&self, timeout: Duration) -> TaskResult<ValueContainer> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last = None;
        for link in &self.results {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            last = Some(link.get(remaining).await?);
        }
        last.ok_or_else(|| TaskError::InvalidWorkflow("empty chain".to_string()))
    }
}

/// Parallel header plus callback.
#[derive(Debug, Clone)]
pub struct Chord {
    header: Vec<TaskSignature>,
    callback: TaskSignature,
}

impl Chord {
    pub fn new(header: Vec<TaskSignature>, callback: TaskSignature) -> Self {
        Self { header, callback }
    }

    /// Submit the header tasks; the callback is submitted by a driver once
    /// every header task has succeeded.
    pub async fn apply(self, client: &TaskClient) -> TaskResult<ChordResult> {
        if self.header.is_empty() {
            return Err(TaskError::InvalidWorkflow(
                "chord header must have at least one task".to_string(),
            ));
        }

        let chord_id = TaskId::new();
        let mut header_ids = Vec::with_capacity(self.header.len());
        for signature in self.header {
            let mut task = signature.into_task();
            task.root_id = Some(chord_id.clone());
            header_ids.push(task.id.clone());
            client.submit_task(task).await?;
        }

        let mut callback_task = self.callback.into_task();
        callback_task.root_id = Some(chord_id.clone());
        callback_task.parent_id = Some(chord_id.clone());
        let callback_id = callback_task.id.clone();

        let driver_client = client.clone();
        let driver_header = header_ids.clone();
        client.executor().spawn(Box::pin(async move {
            drive_chord(driver_client, driver_header, callback_task).await;
        }));

        Ok(ChordResult {
            chord_id,
            header: header_ids
                .iter()
                .map(|id| client.result_for(id.clone()))
                .collect(),
            callback: client.result_for(callback_id),
        })
    }
}

async fn drive_chord(client: TaskClient, header_ids: Vec<TaskId>, mut callback: Task) {
    let backend = client.backend().clone();
    let mut results = ValueContainer::new();

    for (index, id) in header_ids.iter().enumerate() {
        let record = match wait_terminal(&backend, id).await {
            Some(record) => record,
            None => return,
        };
        if record.state != TaskState::Succeeded {
            tracing::debug!(
                header_task = %id,
                state = %record.state,
                "Chord header task did not succeed; callback withheld"
            );
            return;
        }
        results.set(
            index.to_string(),
            record.result.unwrap_or_default(),
        );
    }

    callback.payload.set(HEADER_RESULTS_KEY, results);
    if let Err(e) = client.submit_task(callback).await {
        tracing::warn!(error = %e, "Chord callback submission failed");
    }
}

/// Wait indefinitely for a task to reach a terminal state.
///
/// Returns `None` when the backend reports a non-timeout error (e.g. the
/// record was reclaimed), which ends the workflow driver.
async fn wait_terminal(
    backend: &Arc<dyn ResultBackend>,
    id: &TaskId,
) -> Option<crate::backend::TaskRecord> {
    loop {
        match backend.wait_for_result(id, Duration::from_secs(60)).await {
            Ok(record) => return Some(record),
            Err(TaskError::Timeout(_)) => continue,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "Workflow wait failed");
                return None;
            }
        }
    }
}

/// Handle to a running chord.
#[derive(Clone)]
pub struct ChordResult {
    chord_id: TaskId,
    header: Vec<AsyncResult>,
    callback: AsyncResult,
}

impl ChordResult {
    pub fn chord_id(&self) -> &TaskId {
        &self.chord_id
    }

    pub fn header(&self) -> &[AsyncResult] {
        &self.header
    }

    pub fn callback(&self) -> &AsyncResult {
        &self.callback
    }

    /// Whether every header task has completed
    pub async fn header_ready(&self) -> bool {
        for result in &self.header {
            if !result.is_ready().await {
                return false;
            }
        }
        true
    }

    /// Wait for the callback's payload. Header failures surface as the
    /// failing task's error.
    pub async fn get(&self, timeout: Duration) -> TaskResult<ValueContainer> {
        let deadline = tokio::time::Instant::now() + timeout;
        for result in &self.header {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            result.get(remaining).await?;
        }
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or(Duration::ZERO);
        self.callback.get(remaining).await
    }
}

//! Call / TaskContext - ハンドラに渡される引数と実行コンテキスト

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{Kwargs, ResultRecord, TaskError, TaskId};
use crate::ports::ResultStore;

/// Positional and keyword arguments of one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Call {
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl Call {
    pub fn new(args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self { args, kwargs }
    }

    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| TaskError::failed(format!("missing positional argument {index}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskError::failed(format!("argument {index}: {e}")))
    }

    /// `None` when the keyword was not passed.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TaskError> {
        self.kwargs
            .get(name)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| TaskError::failed(format!("keyword {name}: {e}")))
            })
            .transpose()
    }

    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, TaskError> {
        Ok(self.kwarg(name)?.unwrap_or(default))
    }
}

/// Where PROGRESS updates go.
#[derive(Clone)]
pub(crate) struct ProgressSink {
    pub(crate) store: Arc<dyn ResultStore>,
    pub(crate) ttl: Option<Duration>,
    pub(crate) task: String,
    pub(crate) worker: String,
}

/// Execution context of one task attempt.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task: String,
    pub retries: u32,
    pub max_retries: u32,
    soft_cancel: CancellationToken,
    progress: Option<ProgressSink>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        task: impl Into<String>,
        retries: u32,
        max_retries: u32,
        soft_cancel: CancellationToken,
        progress: Option<ProgressSink>,
    ) -> Self {
        Self {
            task_id,
            task: task.into(),
            retries,
            max_retries,
            soft_cancel,
            progress,
        }
    }

    /// Context with no result store, for calling handlers directly in tests.
    pub fn detached(task_id: TaskId, task: impl Into<String>) -> Self {
        Self::new(task_id, task, 0, 0, CancellationToken::new(), None)
    }

    /// Set once the soft time limit passes or the task is revoked with
    /// `terminate`. Handlers should wind down and return
    /// `TaskError::SoftTimeout`.
    pub fn is_cancelled(&self) -> bool {
        self.soft_cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.soft_cancel.cancelled().await
    }

    /// Record a PROGRESS state with `meta`. Best effort: a store outage is
    /// logged and does not fail the task.
    pub async fn update_progress(&self, meta: Value) {
        let Some(sink) = &self.progress else {
            return;
        };
        let record = ResultRecord::progress(self.task_id, meta)
            .with_task(sink.task.clone(), self.retries)
            .with_worker(sink.worker.clone());
        if let Err(e) = sink.store.set_status(record, sink.ttl).await {
            warn!(task.id = %self.task_id, error = %e, "progress update dropped");
        }
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("task", &self.task)
            .field("retries", &self.retries)
            .field("max_retries", &self.max_retries)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

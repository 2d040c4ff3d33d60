//! Errors - タスクレベルのエラー型と分類
//!
//! Two types live here:
//! - [`TaskError`]: what a handler returns when it does not succeed.
//! - [`TaskFailure`]: what ends up in a FAILURE/REVOKED record and what
//!   callers of `AsyncResult::get` receive.
//!
//! Neither is an infrastructure error. Broker and store outages are
//! `BrokerError` / `StoreError` and never turn into task failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Key of the object that stands in for a failed slot when results are
/// returned as data (`propagate = false`, partial chords).
pub const ERROR_MARKER_KEY: &str = "__error__";

/// Classification of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an application error.
    HandlerError,
    /// No handler registered under the envelope's task name.
    TaskNotFound,
    /// The handler gave up after observing the soft cancellation signal.
    SoftTimeout,
    /// The supervisor killed the execution unit (hard limit or hung soft-timeout handling).
    HardTimeoutKill,
    /// Retry budget exhausted; `cause` holds the last retry's reason.
    MaxRetriesExceeded,
    /// A chord callback was not run because a header member failed.
    ChordError,
    /// Revoked by a control request or expired before it could run.
    Revoked,
}

impl FailureKind {
    /// Retrying cannot fix these.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            FailureKind::TaskNotFound | FailureKind::MaxRetriesExceeded | FailureKind::Revoked
        )
    }
}

/// A recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<TaskFailure>>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: TaskFailure) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// `{"__error__": {...}}`, the in-place representation of this failure.
    pub fn to_marker(&self) -> Value {
        let inner = serde_json::to_value(self).unwrap_or(Value::Null);
        let mut map = serde_json::Map::new();
        map.insert(ERROR_MARKER_KEY.to_string(), inner);
        Value::Object(map)
    }

    /// Inverse of [`TaskFailure::to_marker`].
    pub fn from_marker(value: &Value) -> Option<TaskFailure> {
        let inner = value.as_object()?.get(ERROR_MARKER_KEY)?;
        serde_json::from_value(inner.clone()).ok()
    }

    /// Chain of causes, outermost first.
    pub fn causes(&self) -> impl Iterator<Item = &TaskFailure> {
        std::iter::successors(Some(self), |f| f.cause.as_deref())
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by {cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskFailure {}

/// Returned by a handler instead of a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    /// Application error. Retried only when the task is registered with `autoretry`.
    #[error("{0}")]
    Failed(String),

    /// Explicit retry request. `countdown` overrides the backoff policy.
    #[error("retry requested: {cause}")]
    Retry {
        countdown: Option<Duration>,
        cause: String,
    },

    /// The handler observed the soft cancellation signal and stopped.
    #[error("soft time limit exceeded")]
    SoftTimeout,
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    pub fn retry(cause: impl Into<String>) -> Self {
        TaskError::Retry {
            countdown: None,
            cause: cause.into(),
        }
    }

    pub fn retry_in(countdown: Duration, cause: impl Into<String>) -> Self {
        TaskError::Retry {
            countdown: Some(countdown),
            cause: cause.into(),
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::Failed(format!("json decode: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_roundtrip() {
        let failure = TaskFailure::new(FailureKind::MaxRetriesExceeded, "gave up")
            .with_cause(TaskFailure::new(FailureKind::HandlerError, "flaky"));

        let marker = failure.to_marker();
        assert!(marker.get(ERROR_MARKER_KEY).is_some());
        assert_eq!(TaskFailure::from_marker(&marker), Some(failure));
    }

    #[test]
    fn plain_values_are_not_markers() {
        assert_eq!(TaskFailure::from_marker(&serde_json::json!(42)), None);
        assert_eq!(
            TaskFailure::from_marker(&serde_json::json!({"error": "x"})),
            None
        );
    }

    #[test]
    fn causes_walks_outermost_first() {
        let failure = TaskFailure::new(FailureKind::MaxRetriesExceeded, "outer")
            .with_cause(TaskFailure::new(FailureKind::HandlerError, "inner"));
        let kinds: Vec<_> = failure.causes().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![FailureKind::MaxRetriesExceeded, FailureKind::HandlerError]
        );
        assert!(failure.to_string().contains("caused by"));
    }
}

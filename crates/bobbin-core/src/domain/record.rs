//! Records kept in the result store.
//!
//! - `ResultRecord`: status/result of one task id
//! - `GroupMeta`: membership of a group and, for chords, the callback
//! - `WorkerSnapshot`: what a worker reports for inspection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::canvas::{Canvas, ChordErrorPolicy};
use super::errors::{FailureKind, TaskFailure};
use super::ids::{GroupId, TaskId};
use super::state::TaskState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub state: TaskState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,

    /// Progress payload (PROGRESS) or retry details (RETRY).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,

    #[serde(default)]
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_done: Option<DateTime<Utc>>,
}

impl ResultRecord {
    fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            result: None,
            error: None,
            traceback: None,
            meta: None,
            retries: 0,
            task: None,
            worker: None,
            date_done: None,
        }
    }

    /// What readers see for an id the store has never heard of.
    pub fn pending(task_id: TaskId) -> Self {
        Self::new(task_id, TaskState::Pending)
    }

    pub fn started(task_id: TaskId) -> Self {
        Self::new(task_id, TaskState::Started)
    }

    pub fn progress(task_id: TaskId, meta: Value) -> Self {
        let mut r = Self::new(task_id, TaskState::Progress);
        r.meta = Some(meta);
        r
    }

    pub fn retry(task_id: TaskId, meta: Value) -> Self {
        let mut r = Self::new(task_id, TaskState::Retry);
        r.meta = Some(meta);
        r
    }

    pub fn success(task_id: TaskId, result: Value, at: DateTime<Utc>) -> Self {
        let mut r = Self::new(task_id, TaskState::Success);
        r.result = Some(result);
        r.date_done = Some(at);
        r
    }

    pub fn failure(task_id: TaskId, error: TaskFailure, at: DateTime<Utc>) -> Self {
        let state = if error.kind == FailureKind::Revoked {
            TaskState::Revoked
        } else {
            TaskState::Failure
        };
        let mut r = Self::new(task_id, state);
        r.error = Some(error);
        r.date_done = Some(at);
        r
    }

    pub fn revoked(task_id: TaskId, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::failure(task_id, TaskFailure::new(FailureKind::Revoked, reason), at)
    }

    pub fn with_task(mut self, task: impl Into<String>, retries: u32) -> Self {
        self.task = Some(task.into());
        self.retries = retries;
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_terminal()
    }

    /// Result value for SUCCESS, error marker for failures, `None` otherwise.
    pub fn outcome_value(&self) -> Option<Value> {
        match self.state {
            TaskState::Success => Some(self.result.clone().unwrap_or(Value::Null)),
            TaskState::Failure | TaskState::Revoked => Some(self.recorded_failure().to_marker()),
            _ => None,
        }
    }

    /// Recorded failure, synthesized if a failed record has no error body.
    pub fn recorded_failure(&self) -> TaskFailure {
        self.error.clone().unwrap_or_else(|| {
            let kind = if self.state == TaskState::Revoked {
                FailureKind::Revoked
            } else {
                FailureKind::HandlerError
            };
            TaskFailure::new(kind, format!("task {} ended in {}", self.task_id, self.state))
        })
    }
}

/// Membership of a group. For chords, also the callback and its policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    pub group_id: GroupId,
    /// Member ids in definition order.
    pub members: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<ChordCallback>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordCallback {
    pub body: Canvas,
    pub policy: ChordErrorPolicy,
}

impl GroupMeta {
    pub fn chord_size(&self) -> Option<usize> {
        self.callback.as_ref().map(|_| self.members.len())
    }
}

/// One in-flight task as reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: TaskId,
    pub task: String,
    pub retries: u32,
    pub started_at: DateTime<Utc>,
}

/// Periodic self-report of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub hostname: String,
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub registered: Vec<String>,
    pub active: Vec<ActiveTask>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn revoked_failure_uses_revoked_state() {
        let r = ResultRecord::revoked(TaskId::generate(), "revoked by request", at());
        assert_eq!(r.state, TaskState::Revoked);
        assert_eq!(r.recorded_failure().kind, FailureKind::Revoked);
    }

    #[test]
    fn failure_record_returns_its_error() {
        let error = TaskFailure::new(FailureKind::HandlerError, "boom");
        let r = ResultRecord::failure(TaskId::generate(), error, at());
        assert_eq!(r.state, TaskState::Failure);
        let recorded = r.recorded_failure();
        assert_eq!(recorded.kind, FailureKind::HandlerError);
        assert_eq!(recorded.message, "boom");
    }

    #[test]
    fn outcome_value_is_marker_for_failures() {
        let id = TaskId::generate();
        let ok = ResultRecord::success(id, json!(3), at());
        assert_eq!(ok.outcome_value(), Some(json!(3)));

        let failed = ResultRecord::failure(
            id,
            TaskFailure::new(FailureKind::HandlerError, "boom"),
            at(),
        );
        let marker = failed.outcome_value().unwrap();
        assert_eq!(TaskFailure::from_marker(&marker).unwrap().message, "boom");

        assert_eq!(ResultRecord::started(id).outcome_value(), None);
    }

    #[test]
    fn record_roundtrip_json() {
        let r = ResultRecord::progress(TaskId::generate(), json!({"current": 1, "total": 4}))
            .with_task("tasks.long", 0)
            .with_worker("w1");
        let s = serde_json::to_string(&r).unwrap();
        let back: ResultRecord = serde_json::from_str(&s).unwrap();
        assert_eq!(back, r);
    }
}

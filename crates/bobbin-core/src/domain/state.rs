//! State - タスクの状態
//!
//! State transitions as seen from the result store:
//! - PENDING -> STARTED -> (PROGRESS)* -> SUCCESS
//! - PENDING -> STARTED -> RETRY -> STARTED -> ... (until max_retries)
//! - PENDING -> STARTED -> FAILURE
//! - PENDING | STARTED -> REVOKED
//!
//! PENDING is never written; it is what a reader sees when no record exists.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Progress,
    Retry,
    Success,
    Failure,
    Revoked,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Revoked
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TaskState::Failure | TaskState::Revoked)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Progress => "PROGRESS",
            TaskState::Retry => "RETRY",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Revoked => "REVOKED",
        };
        f.write_str(s)
    }
}

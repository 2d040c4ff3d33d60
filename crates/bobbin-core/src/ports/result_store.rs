//! ResultStore port - 状態・結果・chord barrier の保存先
//!
//! # 契約
//! - task id ごとに read-your-writes
//! - `increment_and_check` はアトミック。同じ member を二度数えない
//! - TTL を過ぎたレコードは存在しないものとして扱われる

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{GroupId, GroupMeta, ResultRecord, TaskId, WorkerSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("result store unavailable: {0}")]
    Unavailable(String),

    #[error("counter {key} still contended after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result of one barrier increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierTick {
    pub count: usize,
    /// True for exactly one caller: the one whose increment reached `expected`.
    pub is_last: bool,
}

/// A revocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revocation {
    /// Also stop the task if it is already running.
    pub terminate: bool,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn set_status(
        &self,
        record: ResultRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// `None` when the id is unknown (readers treat it as PENDING).
    async fn get_status(&self, task_id: TaskId) -> Result<Option<ResultRecord>, StoreError>;

    async fn save_group(&self, meta: GroupMeta, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn get_group(&self, group_id: GroupId) -> Result<Option<GroupMeta>, StoreError>;

    /// Count `member` as finished and report whether it completed the group.
    async fn increment_and_check(
        &self,
        group_id: GroupId,
        member: TaskId,
        expected: usize,
        ttl: Option<Duration>,
    ) -> Result<BarrierTick, StoreError>;

    async fn revoke(
        &self,
        task_id: TaskId,
        terminate: bool,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn revocation(&self, task_id: TaskId) -> Result<Option<Revocation>, StoreError>;

    async fn save_worker_snapshot(
        &self,
        snapshot: WorkerSnapshot,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn list_worker_snapshots(&self) -> Result<Vec<WorkerSnapshot>, StoreError>;
}

// ========================================
// CAS ベースの barrier（アトミック加算を持たないストア向け）
// ========================================

/// Minimal versioned counter for stores without an atomic increment.
#[async_trait]
pub trait CasCounter: Send + Sync {
    /// Current value and its version (`(0, 0)` for a missing key).
    async fn load(&self, key: &str) -> Result<(usize, u64), StoreError>;

    /// Write `value` only if the version is still `version`.
    async fn compare_and_swap(
        &self,
        key: &str,
        version: u64,
        value: usize,
    ) -> Result<bool, StoreError>;
}

/// `increment_and_check` on top of a [`CasCounter`].
///
/// Liveness risk: under heavy contention every attempt can lose the race.
/// After `max_attempts` lost races this gives up with
/// [`StoreError::Contention`], which the worker treats like an unavailable
/// store and retries with backoff. Unlike the native contract, a plain
/// counter cannot tell a redelivered member from a new one.
pub async fn increment_with_cas(
    counter: &dyn CasCounter,
    key: &str,
    expected: usize,
    max_attempts: u32,
) -> Result<BarrierTick, StoreError> {
    for _ in 0..max_attempts {
        let (current, version) = counter.load(key).await?;
        let next = current + 1;
        if counter.compare_and_swap(key, version, next).await? {
            return Ok(BarrierTick {
                count: next,
                is_last: next == expected,
            });
        }
    }
    Err(StoreError::Contention {
        key: key.to_string(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Loses the first `conflicts` swaps.
    struct RacyCounter {
        slots: Mutex<HashMap<String, (usize, u64)>>,
        conflicts: Mutex<u32>,
    }

    impl RacyCounter {
        fn new(conflicts: u32) -> Self {
            Self {
                slots: Mutex::new(HashMap::new()),
                conflicts: Mutex::new(conflicts),
            }
        }
    }

    #[async_trait]
    impl CasCounter for RacyCounter {
        async fn load(&self, key: &str) -> Result<(usize, u64), StoreError> {
            Ok(self.slots.lock().await.get(key).copied().unwrap_or((0, 0)))
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            version: u64,
            value: usize,
        ) -> Result<bool, StoreError> {
            let mut conflicts = self.conflicts.lock().await;
            if *conflicts > 0 {
                *conflicts -= 1;
                return Ok(false);
            }
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(key.to_string()).or_insert((0, 0));
            if slot.1 != version {
                return Ok(false);
            }
            *slot = (value, version + 1);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn cas_increment_survives_a_few_conflicts() {
        let counter = RacyCounter::new(2);
        let first = increment_with_cas(&counter, "g", 2, 5).await.unwrap();
        assert_eq!(first, BarrierTick { count: 1, is_last: false });

        let second = increment_with_cas(&counter, "g", 2, 5).await.unwrap();
        assert_eq!(second, BarrierTick { count: 2, is_last: true });
    }

    #[tokio::test]
    async fn cas_increment_gives_up_after_bounded_attempts() {
        let counter = RacyCounter::new(10);
        let err = increment_with_cas(&counter, "g", 2, 3).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Contention {
                key: "g".to_string(),
                attempts: 3
            }
        );
    }
}

//! InMemoryResultStore - 開発用・テスト用の result store
//!
//! 全データを 1 つの `Mutex` の下に置くので、barrier の加算は自明にアトミックです。
//! TTL は tokio の時計で評価されます。期限切れのエントリは読み出し時に無視され、
//! 書き込み時の掃除（最大で `SWEEP_INTERVAL` に 1 回）で削除されます。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::{GroupId, GroupMeta, ResultRecord, TaskId, WorkerSnapshot};
use crate::ports::{BarrierTick, ResultStore, Revocation, StoreError};

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn live(&self, now: Instant) -> Option<&T> {
        match self.expires_at {
            Some(at) if at <= now => None,
            _ => Some(&self.value),
        }
    }
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<TaskId, Entry<ResultRecord>>,
    groups: HashMap<GroupId, Entry<GroupMeta>>,
    barriers: HashMap<GroupId, Entry<HashSet<TaskId>>>,
    revoked: HashMap<TaskId, Entry<Revocation>>,
    workers: HashMap<String, Entry<WorkerSnapshot>>,
    next_sweep: Option<Instant>,
}

impl StoreState {
    /// Drop expired entries from every map.
    fn sweep(&mut self, now: Instant) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        self.next_sweep = Some(now + SWEEP_INTERVAL);
        self.records.retain(|_, e| e.live(now).is_some());
        self.groups.retain(|_, e| e.live(now).is_some());
        self.barriers.retain(|_, e| e.live(now).is_some());
        self.revoked.retain(|_, e| e.live(now).is_some());
        self.workers.retain(|_, e| e.live(now).is_some());
    }
}

pub struct InMemoryResultStore {
    state: Mutex<StoreState>,
    available: AtomicBool,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory result store is offline".into(),
            ))
        }
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn set_status(
        &self,
        record: ResultRecord,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.sweep(Instant::now());
        state.records.insert(record.task_id, Entry::new(record, ttl));
        Ok(())
    }

    async fn get_status(&self, task_id: TaskId) -> Result<Option<ResultRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .records
            .get(&task_id)
            .and_then(|e| e.live(now))
            .cloned())
    }

    async fn save_group(&self, meta: GroupMeta, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.sweep(Instant::now());
        state.groups.insert(meta.group_id, Entry::new(meta, ttl));
        Ok(())
    }

    async fn get_group(&self, group_id: GroupId) -> Result<Option<GroupMeta>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .groups
            .get(&group_id)
            .and_then(|e| e.live(now))
            .cloned())
    }

    async fn increment_and_check(
        &self,
        group_id: GroupId,
        member: TaskId,
        expected: usize,
        ttl: Option<Duration>,
    ) -> Result<BarrierTick, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.sweep(now);

        let entry = state
            .barriers
            .entry(group_id)
            .or_insert_with(|| Entry::new(HashSet::new(), ttl));
        if entry.live(now).is_none() {
            *entry = Entry::new(HashSet::new(), ttl);
        }

        let newly_counted = entry.value.insert(member);
        let count = entry.value.len();
        Ok(BarrierTick {
            count,
            is_last: newly_counted && count == expected,
        })
    }

    async fn revoke(
        &self,
        task_id: TaskId,
        terminate: bool,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.sweep(Instant::now());
        // terminate is sticky: a later plain revoke does not downgrade it
        let terminate = terminate
            || state
                .revoked
                .get(&task_id)
                .and_then(|e| e.live(Instant::now()))
                .is_some_and(|r| r.terminate);
        state
            .revoked
            .insert(task_id, Entry::new(Revocation { terminate }, ttl));
        Ok(())
    }

    async fn revocation(&self, task_id: TaskId) -> Result<Option<Revocation>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .revoked
            .get(&task_id)
            .and_then(|e| e.live(Instant::now()))
            .copied())
    }

    async fn save_worker_snapshot(
        &self,
        snapshot: WorkerSnapshot,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.sweep(Instant::now());
        state
            .workers
            .insert(snapshot.hostname.clone(), Entry::new(snapshot, ttl));
        Ok(())
    }

    async fn list_worker_snapshots(&self) -> Result<Vec<WorkerSnapshot>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut snapshots: Vec<WorkerSnapshot> = state
            .workers
            .values()
            .filter_map(|e| e.live(now).cloned())
            .collect();
        snapshots.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskState;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn read_your_writes() {
        let store = InMemoryResultStore::new();
        let id = TaskId::generate();
        assert_eq!(store.get_status(id).await.unwrap(), None);

        store
            .set_status(ResultRecord::started(id), None)
            .await
            .unwrap();
        assert_eq!(
            store.get_status(id).await.unwrap().unwrap().state,
            TaskState::Started
        );

        store
            .set_status(ResultRecord::success(id, json!(1), chrono::Utc::now()), None)
            .await
            .unwrap();
        assert_eq!(
            store.get_status(id).await.unwrap().unwrap().state,
            TaskState::Success
        );
    }

    #[tokio::test(start_paused = true)]
    async fn records_expire_after_ttl() {
        let store = InMemoryResultStore::new();
        let id = TaskId::generate();
        store
            .set_status(ResultRecord::started(id), Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get_status(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn barrier_reports_last_exactly_once() {
        let store = Arc::new(InMemoryResultStore::new());
        let group = GroupId::generate();
        let members: Vec<TaskId> = (0..4).map(|_| TaskId::generate()).collect();

        let mut handles = Vec::new();
        for member in members.clone() {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .increment_and_check(group, member, 4, None)
                    .await
                    .unwrap()
            }));
        }
        let mut lasts = 0;
        for h in handles {
            if h.await.unwrap().is_last {
                lasts += 1;
            }
        }
        assert_eq!(lasts, 1);

        // a redelivered member does not fire the barrier again
        let again = store
            .increment_and_check(group, members[0], 4, None)
            .await
            .unwrap();
        assert_eq!(again, BarrierTick { count: 4, is_last: false });
    }

    #[tokio::test]
    async fn terminate_flag_is_sticky() {
        let store = InMemoryResultStore::new();
        let id = TaskId::generate();
        store.revoke(id, true, None).await.unwrap();
        store.revoke(id, false, None).await.unwrap();
        assert_eq!(
            store.revocation(id).await.unwrap(),
            Some(Revocation { terminate: true })
        );
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = InMemoryResultStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get_status(TaskId::generate()).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_evicted_on_write() {
        let store = InMemoryResultStore::new();
        let ttl = Some(Duration::from_secs(1));
        for _ in 0..1000 {
            store
                .set_status(ResultRecord::started(TaskId::generate()), ttl)
                .await
                .unwrap();
        }
        let gid = GroupId::generate();
        store
            .increment_and_check(gid, TaskId::generate(), 2, ttl)
            .await
            .unwrap();
        store.revoke(TaskId::generate(), false, ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        let kept = TaskId::generate();
        store
            .set_status(ResultRecord::started(kept), None)
            .await
            .unwrap();

        let state = store.state.lock().await;
        assert_eq!(state.records.len(), 1);
        assert!(state.records.contains_key(&kept));
        assert!(state.barriers.is_empty());
        assert!(state.revoked.is_empty());
    }
}

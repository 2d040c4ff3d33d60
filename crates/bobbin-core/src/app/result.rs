//! AsyncResult / GroupResult - 結果の取得
//!
//! ハンドルは result store をポーリングするだけで、ワーカーとは直接話しません。
//! ポーリング間隔は `[result] poll_interval_ms` より短くなりません。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::domain::{GroupId, ResultRecord, TaskFailure, TaskId, TaskState};
use crate::ports::{ResultStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error("result not ready after {0:?}")]
    Timeout(Duration),

    #[error("task failed: {0}")]
    Failed(TaskFailure),

    #[error("group {0} is unknown or expired")]
    GroupNotFound(GroupId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Options for [`AsyncResult::get_with`] and friends.
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    /// Raise the first failure instead of returning an error marker.
    pub propagate: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            propagate: true,
        }
    }
}

impl GetOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn propagate(mut self, propagate: bool) -> Self {
        self.propagate = propagate;
        self
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handle on one task id.
#[derive(Clone)]
pub struct AsyncResult {
    id: TaskId,
    store: Arc<dyn ResultStore>,
    poll_interval: Duration,
    parent: Option<Box<AsyncResult>>,
}

impl AsyncResult {
    pub fn new(id: TaskId, store: Arc<dyn ResultStore>, poll_interval: Duration) -> Self {
        Self {
            id,
            store,
            poll_interval,
            parent: None,
        }
    }

    pub(crate) fn with_parent(mut self, parent: Option<AsyncResult>) -> Self {
        self.parent = parent.map(Box::new);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Previous step of a chain, if this handle came from one.
    pub fn parent(&self) -> Option<&AsyncResult> {
        self.parent.as_deref()
    }

    /// Current record; PENDING for ids the store does not know.
    pub async fn record(&self) -> Result<ResultRecord, ResultError> {
        Ok(self
            .store
            .get_status(self.id)
            .await?
            .unwrap_or_else(|| ResultRecord::pending(self.id)))
    }

    pub async fn state(&self) -> Result<TaskState, ResultError> {
        Ok(self.record().await?.state)
    }

    pub async fn ready(&self) -> Result<bool, ResultError> {
        Ok(self.state().await?.is_terminal())
    }

    pub async fn successful(&self) -> Result<bool, ResultError> {
        Ok(self.state().await? == TaskState::Success)
    }

    pub async fn failed(&self) -> Result<bool, ResultError> {
        Ok(self.state().await?.is_failure())
    }

    /// Wait for the result and raise on failure.
    ///
    /// A failed earlier step of the chain resolves the wait too: its failure
    /// is raised (or returned as a marker) since this step will never run.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Value, ResultError> {
        self.get_with(GetOptions {
            timeout,
            propagate: true,
        })
        .await
    }

    pub async fn get_with(&self, options: GetOptions) -> Result<Value, ResultError> {
        let record = self.wait(options.deadline(), options.timeout).await?;
        outcome(&record, options.propagate)
    }

    async fn wait(
        &self,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<ResultRecord, ResultError> {
        loop {
            let record = self.record().await?;
            if record.is_ready() {
                return Ok(record);
            }
            if let Some(failed) = self.failed_ancestor().await? {
                return Ok(failed);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ResultError::Timeout(timeout.unwrap_or_default()));
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Nearest earlier step that ended in failure.
    async fn failed_ancestor(&self) -> Result<Option<ResultRecord>, ResultError> {
        let mut next = self.parent.as_deref();
        while let Some(step) = next {
            let record = step.record().await?;
            if record.state.is_failure() {
                return Ok(Some(record));
            }
            // a step only runs once its predecessor succeeded
            if record.state == TaskState::Success {
                break;
            }
            next = step.parent.as_deref();
        }
        Ok(None)
    }
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .finish()
    }
}

fn outcome(record: &ResultRecord, propagate: bool) -> Result<Value, ResultError> {
    match record.state {
        TaskState::Success => Ok(record.result.clone().unwrap_or(Value::Null)),
        _ if propagate => Err(ResultError::Failed(record.recorded_failure())),
        _ => Ok(record.recorded_failure().to_marker()),
    }
}

/// Ordered handle on a group's members.
#[derive(Debug, Clone)]
pub struct GroupResult {
    group_id: Option<GroupId>,
    results: Vec<AsyncResult>,
}

impl GroupResult {
    pub fn new(group_id: Option<GroupId>, results: Vec<AsyncResult>) -> Self {
        Self { group_id, results }
    }

    /// Rebuild a handle from the membership saved when the group was sent.
    pub async fn restore(
        group_id: GroupId,
        store: Arc<dyn ResultStore>,
        poll_interval: Duration,
    ) -> Result<Self, ResultError> {
        let meta = store
            .get_group(group_id)
            .await?
            .ok_or(ResultError::GroupNotFound(group_id))?;
        let results = meta
            .members
            .into_iter()
            .map(|id| AsyncResult::new(id, Arc::clone(&store), poll_interval))
            .collect();
        Ok(Self::new(Some(group_id), results))
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    /// Member handles in definition order.
    pub fn results(&self) -> &[AsyncResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub async fn completed_count(&self) -> Result<usize, ResultError> {
        let mut n = 0;
        for r in &self.results {
            if r.state().await? == TaskState::Success {
                n += 1;
            }
        }
        Ok(n)
    }

    pub async fn ready(&self) -> Result<bool, ResultError> {
        for r in &self.results {
            if !r.ready().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn successful(&self) -> Result<bool, ResultError> {
        for r in &self.results {
            if !r.successful().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn failed(&self) -> Result<bool, ResultError> {
        for r in &self.results {
            if r.failed().await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Wait for every member, then return results in definition order.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Vec<Value>, ResultError> {
        self.get_with(GetOptions {
            timeout,
            propagate: true,
        })
        .await
    }

    pub async fn get_with(&self, options: GetOptions) -> Result<Vec<Value>, ResultError> {
        let deadline = options.deadline();
        let mut records = Vec::with_capacity(self.results.len());
        for r in &self.results {
            records.push(r.wait(deadline, options.timeout).await?);
        }
        records
            .iter()
            .map(|record| outcome(record, options.propagate))
            .collect()
    }
}

/// Handle on a chord: the header members plus the callback's result.
#[derive(Debug, Clone)]
pub struct ChordResult {
    pub header: GroupResult,
    pub body: Box<CanvasResult>,
}

/// What `Client::apply_async` returns for a canvas.
#[derive(Debug, Clone)]
pub enum CanvasResult {
    /// A single task, or the last task of a chain (earlier steps via `parent()`).
    Task(AsyncResult),
    Group(GroupResult),
    Chord(ChordResult),
}

impl CanvasResult {
    pub fn as_task(&self) -> Option<&AsyncResult> {
        match self {
            CanvasResult::Task(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&GroupResult> {
        match self {
            CanvasResult::Group(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_chord(&self) -> Option<&ChordResult> {
        match self {
            CanvasResult::Chord(c) => Some(c),
            _ => None,
        }
    }

    /// Final value: a group's results become a JSON array, a chord yields
    /// its callback's result.
    pub fn get(&self, options: GetOptions) -> BoxFuture<'_, Result<Value, ResultError>> {
        Box::pin(async move {
            match self {
                CanvasResult::Task(r) => r.get_with(options).await,
                CanvasResult::Group(g) => g.get_with(options).await.map(Value::Array),
                CanvasResult::Chord(c) => c.body.get(options).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, GroupMeta};
    use crate::impls::InMemoryResultStore;
    use chrono::Utc;
    use serde_json::json;

    fn store() -> Arc<dyn ResultStore> {
        Arc::new(InMemoryResultStore::new())
    }

    fn handle(store: &Arc<dyn ResultStore>, id: TaskId) -> AsyncResult {
        AsyncResult::new(id, Arc::clone(store), Duration::from_millis(10))
    }

    async fn succeed(store: &Arc<dyn ResultStore>, id: TaskId, value: Value) {
        store
            .set_status(ResultRecord::success(id, value, Utc::now()), None)
            .await
            .unwrap();
    }

    async fn fail(store: &Arc<dyn ResultStore>, id: TaskId, message: &str) {
        let failure = TaskFailure::new(FailureKind::HandlerError, message);
        store
            .set_status(ResultRecord::failure(id, failure, Utc::now()), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_id_is_pending() {
        let store = store();
        let r = handle(&store, TaskId::generate());
        assert_eq!(r.state().await.unwrap(), TaskState::Pending);
        assert!(!r.ready().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn get_times_out() {
        let store = store();
        let r = handle(&store, TaskId::generate());
        let err = r.get(Some(Duration::from_millis(100))).await.unwrap_err();
        assert!(matches!(err, ResultError::Timeout(_)));
    }

    #[tokio::test]
    async fn get_waits_for_a_later_write() {
        let store = store();
        let id = TaskId::generate();
        let r = handle(&store, id);

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                succeed(&store, id, json!(7)).await;
            })
        };
        assert_eq!(r.get(Some(Duration::from_secs(2))).await.unwrap(), json!(7));
        writer.await.unwrap();
        assert!(r.successful().await.unwrap());
    }

    #[tokio::test]
    async fn failure_propagates_or_becomes_marker() {
        let store = store();
        let id = TaskId::generate();
        fail(&store, id, "boom").await;
        let r = handle(&store, id);

        match r.get(None).await {
            Err(ResultError::Failed(f)) => assert_eq!(f.message, "boom"),
            other => panic!("expected failure, got {other:?}"),
        }
        let marker = r
            .get_with(GetOptions::default().propagate(false))
            .await
            .unwrap();
        assert_eq!(TaskFailure::from_marker(&marker).unwrap().message, "boom");
        assert!(r.failed().await.unwrap());
    }

    #[tokio::test]
    async fn group_results_keep_definition_order() {
        let store = store();
        let ids: Vec<TaskId> = (0..3).map(|_| TaskId::generate()).collect();
        // completion order differs from definition order
        succeed(&store, ids[2], json!("c")).await;
        succeed(&store, ids[0], json!("a")).await;
        succeed(&store, ids[1], json!("b")).await;

        let group = GroupResult::new(None, ids.iter().map(|id| handle(&store, *id)).collect());
        assert_eq!(
            group.get(None).await.unwrap(),
            vec![json!("a"), json!("b"), json!("c")]
        );
        assert_eq!(group.completed_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn group_propagates_first_failure_in_order() {
        let store = store();
        let ids: Vec<TaskId> = (0..3).map(|_| TaskId::generate()).collect();
        succeed(&store, ids[0], json!(1)).await;
        fail(&store, ids[1], "second").await;
        fail(&store, ids[2], "third").await;

        let group = GroupResult::new(None, ids.iter().map(|id| handle(&store, *id)).collect());
        match group.get(None).await {
            Err(ResultError::Failed(f)) => assert_eq!(f.message, "second"),
            other => panic!("expected failure, got {other:?}"),
        }

        let values = group
            .get_with(GetOptions::default().propagate(false))
            .await
            .unwrap();
        assert_eq!(values[0], json!(1));
        assert!(TaskFailure::from_marker(&values[1]).is_some());
        assert!(TaskFailure::from_marker(&values[2]).is_some());
    }

    #[tokio::test]
    async fn restore_group_from_saved_membership() {
        let store = store();
        let group_id = GroupId::generate();
        let members: Vec<TaskId> = (0..2).map(|_| TaskId::generate()).collect();
        store
            .save_group(
                GroupMeta {
                    group_id,
                    members: members.clone(),
                    callback: None,
                },
                None,
            )
            .await
            .unwrap();

        let group = GroupResult::restore(group_id, Arc::clone(&store), Duration::from_millis(10))
            .await
            .unwrap();
        let ids: Vec<TaskId> = group.results().iter().map(AsyncResult::id).collect();
        assert_eq!(ids, members);

        let missing =
            GroupResult::restore(GroupId::generate(), store, Duration::from_millis(10)).await;
        assert!(matches!(missing, Err(ResultError::GroupNotFound(_))));
    }

    #[tokio::test]
    async fn empty_group_resolves_to_empty_list() {
        let group = GroupResult::new(None, Vec::new());
        assert!(group.get(None).await.unwrap().is_empty());
        assert!(group.ready().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_earlier_step_resolves_the_tail() {
        let store = store();
        let (first, second, tail) = (TaskId::generate(), TaskId::generate(), TaskId::generate());
        fail(&store, first, "first step broke").await;
        let chain = handle(&store, tail).with_parent(Some(
            handle(&store, second).with_parent(Some(handle(&store, first))),
        ));

        match chain.get(Some(Duration::from_secs(1))).await {
            Err(ResultError::Failed(f)) => assert_eq!(f.message, "first step broke"),
            other => panic!("expected the earlier failure, got {other:?}"),
        }
        let marker = chain
            .get_with(GetOptions::default().propagate(false))
            .await
            .unwrap();
        assert_eq!(
            TaskFailure::from_marker(&marker).unwrap().message,
            "first step broke"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn successful_parent_does_not_end_the_wait() {
        let store = store();
        let (first, tail) = (TaskId::generate(), TaskId::generate());
        succeed(&store, first, json!(1)).await;
        let chain = handle(&store, tail).with_parent(Some(handle(&store, first)));

        let err = chain.get(Some(Duration::from_millis(100))).await.unwrap_err();
        assert!(matches!(err, ResultError::Timeout(_)));
    }
}

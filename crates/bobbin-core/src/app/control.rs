//! Control - revoke / inspect / キュー長
//!
//! ワーカーとは result store と broker を介してのみ話します。
//! inspect はワーカーが定期的に書くスナップショットを読むだけです。

use std::collections::BTreeMap;

use tracing::info;

use super::builder::App;
use crate::domain::{ActiveTask, TaskId, WorkerSnapshot};
use crate::error::BobbinError;

#[derive(Clone)]
pub struct Control {
    app: App,
}

impl Control {
    pub(crate) fn new(app: App) -> Self {
        Self { app }
    }

    /// Mark `task_id` revoked.
    ///
    /// A task that has not started yet is skipped and recorded REVOKED when
    /// a worker dequeues it. With `terminate`, a running task is also
    /// cancelled: soft signal first, kill after the grace period.
    pub async fn revoke(&self, task_id: TaskId, terminate: bool) -> Result<(), BobbinError> {
        self.app
            .store
            .revoke(task_id, terminate, self.app.config.result_ttl())
            .await?;
        info!(task.id = %task_id, terminate, "task revoked");
        Ok(())
    }

    /// Latest snapshot of every live worker.
    pub async fn workers(&self) -> Result<Vec<WorkerSnapshot>, BobbinError> {
        Ok(self.app.store.list_worker_snapshots().await?)
    }

    /// In-flight tasks per worker hostname.
    pub async fn inspect_active(&self) -> Result<BTreeMap<String, Vec<ActiveTask>>, BobbinError> {
        Ok(self
            .workers()
            .await?
            .into_iter()
            .map(|s| (s.hostname, s.active))
            .collect())
    }

    /// Registered task names per worker hostname.
    pub async fn inspect_registered(&self) -> Result<BTreeMap<String, Vec<String>>, BobbinError> {
        Ok(self
            .workers()
            .await?
            .into_iter()
            .map(|s| (s.hostname, s.registered))
            .collect())
    }

    /// Waiting (ready or delayed) messages per queue.
    pub async fn queue_lengths(
        &self,
        queues: &[&str],
    ) -> Result<BTreeMap<String, usize>, BobbinError> {
        let mut lengths = BTreeMap::new();
        for queue in queues {
            lengths.insert(
                queue.to_string(),
                self.app.broker.queue_length(queue).await?,
            );
        }
        Ok(lengths)
    }
}

//! Client - producer 側の API

use serde_json::Value;
use tracing::info;

use super::builder::App;
use super::producer::Parent;
use super::result::{AsyncResult, CanvasResult, ChordResult, GroupResult};
use crate::domain::{Canvas, Group, GroupId, Signature, TaskId};
use crate::error::BobbinError;

/// Sends canvases and hands out result handles.
#[derive(Clone)]
pub struct Client {
    app: App,
}

impl Client {
    pub(crate) fn new(app: App) -> Self {
        Self { app }
    }

    /// Freeze ids, send the canvas, and return its result handle.
    ///
    /// For a chain the handle is the last step's result; earlier steps are
    /// reachable through `AsyncResult::parent`.
    pub async fn apply_async(&self, canvas: impl Into<Canvas>) -> Result<CanvasResult, BobbinError> {
        let canvas = canvas.into().freeze(self.app.ids.as_ref());
        self.app.dispatch(&canvas, Parent::default()).await?;
        let result = self.result_for(&canvas, None);
        info!(kind = canvas_kind(&canvas), "canvas submitted");
        Ok(result)
    }

    /// Send one signature. The handle is for this signature itself, even
    /// when it carries `link` continuations.
    pub async fn send(&self, sig: Signature) -> Result<AsyncResult, BobbinError> {
        let id = sig.id().unwrap_or_else(|| self.app.ids.generate_task_id());
        let canvas = Canvas::Task(sig.with_id(id).freeze(self.app.ids.as_ref()));
        self.app.dispatch(&canvas, Parent::default()).await?;
        Ok(self.result(id))
    }

    /// `send(Signature::new(task).args(args))`.
    pub async fn delay<I>(&self, task: &str, args: I) -> Result<AsyncResult, BobbinError>
    where
        I: IntoIterator<Item = Value>,
    {
        self.send(Signature::new(task).args(args)).await
    }

    /// Handle for an id obtained elsewhere.
    pub fn result(&self, id: TaskId) -> AsyncResult {
        AsyncResult::new(
            id,
            self.app.store.clone(),
            self.app.config.result.poll_interval(),
        )
    }

    pub async fn group_result(&self, group_id: GroupId) -> Result<GroupResult, BobbinError> {
        Ok(GroupResult::restore(
            group_id,
            self.app.store.clone(),
            self.app.config.result.poll_interval(),
        )
        .await?)
    }

    fn result_for(&self, canvas: &Canvas, parent: Option<AsyncResult>) -> CanvasResult {
        match canvas {
            Canvas::Task(sig) => {
                let id = sig.id().unwrap_or_else(|| self.app.ids.generate_task_id());
                let result = self.result(id).with_parent(parent);
                match sig.options.link.last() {
                    Some(next) => self.result_for(next, Some(result)),
                    None => CanvasResult::Task(result),
                }
            }
            Canvas::Group(group) => CanvasResult::Group(self.group_handle(group, parent)),
            // the body never runs when the step before the chord fails
            Canvas::Chord(chord) => CanvasResult::Chord(ChordResult {
                header: self.group_handle(&chord.header, parent.clone()),
                body: Box::new(self.result_for(&chord.body, parent)),
            }),
        }
    }

    fn group_handle(&self, group: &Group, parent: Option<AsyncResult>) -> GroupResult {
        let results = group
            .tasks
            .iter()
            .filter_map(Signature::id)
            .map(|id| self.result(id).with_parent(parent.clone()))
            .collect();
        GroupResult::new(group.group_id, results)
    }
}

fn canvas_kind(canvas: &Canvas) -> &'static str {
    match canvas {
        Canvas::Task(sig) if sig.options.link.is_empty() => "task",
        Canvas::Task(_) => "chain",
        Canvas::Group(_) => "group",
        Canvas::Chord(_) => "chord",
    }
}

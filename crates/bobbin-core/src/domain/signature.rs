//! Signature - an unevaluated task invocation.
//!
//! A `Signature` names a task, carries its pre-bound arguments and the
//! delivery options, and lists continuations to fire on success (`link`) or
//! failure (`link_error`). All builder methods take `self` and return a new
//! value; nothing is sent until a client submits it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::canvas::Canvas;
use super::ids::TaskId;
use crate::ports::IdGenerator;

/// Keyword arguments of a call.
pub type Kwargs = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub task: String,

    #[serde(default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub kwargs: Kwargs,

    #[serde(default)]
    pub options: SignatureOptions,
}

/// Delivery options and continuations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureOptions {
    /// Pre-assigned id. Set by `freeze` so result handles exist before the
    /// envelope does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    /// Explicit queue; wins over the routing table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,

    /// Delay relative to the moment the envelope is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown_ms: Option<u64>,

    /// Absolute earliest run time. Wins over `countdown_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link: Vec<Canvas>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link_error: Vec<Canvas>,

    /// Ignore the parent's result when used as a continuation.
    #[serde(default, skip_serializing_if = "is_false")]
    pub immutable: bool,

    /// Spread an array result over several positional args. Producer and
    /// consumer must agree on this; nothing is inferred from the value.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unpack_args: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Signature {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
            options: SignatureOptions::default(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.options.priority = Some(priority);
        self
    }

    pub fn countdown(mut self, delay: Duration) -> Self {
        self.options.countdown_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.options.eta = Some(eta);
        self
    }

    pub fn expires(mut self, at: DateTime<Utc>) -> Self {
        self.options.expires = Some(at);
        self
    }

    pub fn link(mut self, next: impl Into<Canvas>) -> Self {
        self.options.link.push(next.into());
        self
    }

    pub fn link_error(mut self, errback: impl Into<Canvas>) -> Self {
        self.options.link_error.push(errback.into());
        self
    }

    pub fn immutable(mut self) -> Self {
        self.options.immutable = true;
        self
    }

    pub fn unpack_args(mut self) -> Self {
        self.options.unpack_args = true;
        self
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.options.task_id = Some(id);
        self
    }

    pub fn id(&self) -> Option<TaskId> {
        self.options.task_id
    }

    /// Assign ids to this signature and every continuation that lacks one.
    pub fn freeze(mut self, ids: &dyn IdGenerator) -> Self {
        if self.options.task_id.is_none() {
            self.options.task_id = Some(ids.generate_task_id());
        }
        self.options.link = freeze_all(self.options.link, ids);
        self.options.link_error = freeze_all(self.options.link_error, ids);
        self
    }

    /// Copy of this signature with a producer's value bound in front of
    /// the pre-bound positional args.
    ///
    /// - immutable signatures ignore the value
    /// - `unpack_args` spreads an array value over several leading args
    pub fn bind(&self, parent: Option<&Value>) -> Signature {
        let mut bound = self.clone();
        let Some(value) = parent else {
            return bound;
        };
        if self.options.immutable {
            return bound;
        }

        let mut args = match value {
            Value::Array(items) if self.options.unpack_args => items.clone(),
            other => vec![other.clone()],
        };
        args.append(&mut bound.args);
        bound.args = args;
        bound
    }
}

fn freeze_all(canvases: Vec<Canvas>, ids: &dyn IdGenerator) -> Vec<Canvas> {
    canvases.into_iter().map(|c| c.freeze(ids)).collect()
}

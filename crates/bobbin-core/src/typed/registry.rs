//! TaskRegistry - Handler の登録と管理
//!
//! 起動時に一度だけ組み立て、`Arc` で共有した後は読み取り専用です。
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;

/// Per-task execution options. `None` falls back to the app configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOptions {
    pub max_retries: Option<u32>,
    /// Cooperative limit: the soft cancellation token fires.
    pub soft_timeout: Option<Duration>,
    /// Forced limit: the execution unit is killed.
    pub hard_timeout: Option<Duration>,
    /// Retry `TaskError::Failed` with backoff, not just explicit retries.
    pub autoretry: bool,
    /// Queue used when no routing rule matches and for retries.
    pub queue: Option<String>,
}

impl TaskOptions {
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn soft_timeout(mut self, d: Duration) -> Self {
        self.soft_timeout = Some(d);
        self
    }

    pub fn hard_timeout(mut self, d: Duration) -> Self {
        self.hard_timeout = Some(d);
        self
    }

    pub fn autoretry(mut self) -> Self {
        self.autoretry = true;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

/// A registered task. Immutable after registration.
pub struct TaskDefinition {
    pub name: String,
    pub handler: Arc<dyn DynHandler>,
    pub options: TaskOptions,
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("task '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("task '{0}' is not registered")]
    NotFound(String),

    #[error("invalid options for task '{name}': {reason}")]
    InvalidOptions { name: String, reason: String },
}

/// # 使用例
/// ```ignore
/// let mut registry = TaskRegistry::new();
/// registry.register("tasks.add", handler_fn(add), TaskOptions::default())?;
/// registry.register_typed::<Multiply, _>(MultiplyHandler, TaskOptions::default())?;
///
/// let def = registry.resolve("tasks.add")?;
/// ```
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskDefinition>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(
        &mut self,
        name: impl Into<String>,
        handler: H,
        options: TaskOptions,
    ) -> Result<(), RegistryError>
    where
        H: DynHandler + 'static,
    {
        self.insert(name.into(), Arc::new(handler), options)
    }

    pub fn register_typed<T, H>(&mut self, handler: H, options: TaskOptions) -> Result<(), RegistryError>
    where
        T: Task,
        H: Handler<T> + 'static,
    {
        self.insert(
            T::NAME.to_string(),
            Arc::new(TypedHandler::<T, H>::new(handler)),
            options,
        )
    }

    fn insert(
        &mut self,
        name: String,
        handler: Arc<dyn DynHandler>,
        options: TaskOptions,
    ) -> Result<(), RegistryError> {
        if self.tasks.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        if let (Some(soft), Some(hard)) = (options.soft_timeout, options.hard_timeout)
            && soft > hard
        {
            return Err(RegistryError::InvalidOptions {
                name,
                reason: format!("soft_timeout {soft:?} exceeds hard_timeout {hard:?}"),
            });
        }
        let definition = TaskDefinition {
            name: name.clone(),
            handler,
            options,
        };
        self.tasks.insert(name, Arc::new(definition));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<TaskDefinition>, RegistryError> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

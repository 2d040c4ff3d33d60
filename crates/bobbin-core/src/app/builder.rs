//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use super::client::Client;
use super::config::{AppConfig, ConfigError};
use super::control::Control;
use super::routing::Router;
use super::worker::Worker;
use crate::ports::{Broker, Clock, IdGenerator, ResultStore, SystemClock, UlidGenerator};
use crate::typed::{DynHandler, Handler, MessageCodec, RegistryError, Task, TaskOptions, TaskRegistry};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(config)
///     .broker(Arc::new(InMemoryBroker::new()))
///     .result_store(Arc::new(InMemoryResultStore::new()))
///     .register("tasks.add", handler_fn(add), TaskOptions::default())?
///     .expect_tasks(&["tasks.add"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - 二重登録は `register()` の時点でエラー
/// - build() 時に設定の検証、broker / result store の有無、
///   「期待集合 ⊆ 登録済み集合」をチェック
pub struct AppBuilder {
    config: AppConfig,
    registry: TaskRegistry,
    broker: Option<Arc<dyn Broker>>,
    store: Option<Arc<dyn ResultStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    expected_tasks: Option<Vec<String>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("no {0} configured")]
    MissingComponent(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: TaskRegistry::new(),
            broker: None,
            store: None,
            clock: None,
            ids: None,
            expected_tasks: None,
        }
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn result_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to `SystemClock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to a `UlidGenerator` on the app's clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn register<H>(
        mut self,
        name: impl Into<String>,
        handler: H,
        options: TaskOptions,
    ) -> Result<Self, RegistryError>
    where
        H: DynHandler + 'static,
    {
        self.registry.register(name, handler, options)?;
        Ok(self)
    }

    pub fn register_typed<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
        options: TaskOptions,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler, options)?;
        Ok(self)
    }

    /// 期待される task 名のリストを設定
    pub fn expect_tasks(mut self, names: &[&str]) -> Self {
        self.expected_tasks = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let broker = self.broker.ok_or(BuildError::MissingComponent("broker"))?;
        let store = self
            .store
            .ok_or(BuildError::MissingComponent("result store"))?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        Ok(App {
            router: Arc::new(Router::from_config(&self.config)),
            config: Arc::new(self.config),
            registry: Arc::new(self.registry),
            broker,
            store,
            clock,
            ids,
            codec: MessageCodec,
        })
    }
}

/// App は全コンポーネントを束ねるハンドル（clone は安価）
///
/// producer（`client()`）、consumer（`worker()`）、管理操作（`control()`）は
/// すべてここから作ります。
#[derive(Clone)]
pub struct App {
    pub(crate) config: Arc<AppConfig>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) store: Arc<dyn ResultStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) router: Arc<Router>,
    pub(crate) codec: MessageCodec,
}

impl App {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn result_store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn client(&self) -> Client {
        Client::new(self.clone())
    }

    pub fn worker(&self) -> Worker {
        Worker::new(self.clone())
    }

    pub fn control(&self) -> Control {
        Control::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskError;
    use crate::impls::{InMemoryBroker, InMemoryResultStore};
    use crate::typed::{Call, TaskContext, handler_fn};
    use serde_json::{Value, json};

    fn noop() -> impl DynHandler {
        handler_fn(|_ctx: TaskContext, _call: Call| async { Ok::<Value, TaskError>(json!(null)) })
    }

    fn builder() -> AppBuilder {
        AppBuilder::new(AppConfig::default())
            .broker(Arc::new(InMemoryBroker::new()))
            .result_store(Arc::new(InMemoryResultStore::new()))
    }

    #[test]
    fn test_build_success() {
        let app = builder()
            .register("tasks.a", noop(), TaskOptions::default())
            .unwrap()
            .expect_tasks(&["tasks.a"])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let app = builder()
            .register("tasks.a", noop(), TaskOptions::default())
            .unwrap()
            .expect_tasks(&["tasks.a", "tasks.b"])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec!["tasks.b".to_string()]
        ));
    }

    #[test]
    fn test_duplicate_registration_fails_fast() {
        let result = builder()
            .register("tasks.a", noop(), TaskOptions::default())
            .unwrap()
            .register("tasks.a", noop(), TaskOptions::default());
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn test_build_requires_broker() {
        let app = AppBuilder::new(AppConfig::default())
            .result_store(Arc::new(InMemoryResultStore::new()))
            .build();
        assert!(matches!(app, Err(BuildError::MissingComponent("broker"))));
    }

    #[test]
    fn test_build_validates_config() {
        let mut config = AppConfig::default();
        config.worker.concurrency = 0;
        let app = AppBuilder::new(config)
            .broker(Arc::new(InMemoryBroker::new()))
            .result_store(Arc::new(InMemoryResultStore::new()))
            .build();
        assert!(matches!(app, Err(BuildError::Config(_))));
    }
}

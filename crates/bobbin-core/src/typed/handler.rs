//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)
//! - クロージャからの DynHandler (FnHandler)

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;

use super::context::{Call, TaskContext};
use super::task::Task;
use crate::domain::TaskError;

/// Handler は型付きの Task を実行する
///
/// # 使用例
/// ```ignore
/// struct AddHandler;
///
/// #[async_trait]
/// impl Handler<Add> for AddHandler {
///     async fn handle(&self, _ctx: TaskContext, task: Add) -> Result<i64, TaskError> {
///         Ok(task.x + task.y)
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, ctx: TaskContext, task: T) -> Result<T::Output, TaskError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `HashMap<String, Arc<dyn DynHandler>>` に格納できます。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn call(&self, ctx: TaskContext, call: Call) -> Result<Value, TaskError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn call(&self, ctx: TaskContext, call: Call) -> Result<Value, TaskError> {
        let task = T::from_call(&call)?;
        let output = self.handler.handle(ctx, task).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Closure-backed handler: `Fn(TaskContext, Call) -> impl Future<Output = Result<Value, TaskError>>`.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext, Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(TaskContext, Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn call(&self, ctx: TaskContext, call: Call) -> Result<Value, TaskError> {
        (self.f)(ctx, call).await
    }
}

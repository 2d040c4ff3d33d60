//! bobbin-core
//!
//! Distributed task queue: workflows of tasks (chain / group / chord) are
//! sent through a broker, executed by workers, and their outcomes recorded
//! in a result store.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, signature, canvas, envelope, state, record, errors）
//! - **ports**: 抽象化レイヤー（Broker, ResultStore, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryBroker, InMemoryResultStore など開発・テスト用）
//! - **typed**: ハンドラ登録（Task trait, Handler trait, TaskRegistry, MessageCodec）
//! - **app**: アプリケーションロジック（builder, client, worker, control, result）
//! - **observability**: tracing の初期化

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use crate::app::{App, AppBuilder, AppConfig, AsyncResult, Client, Control, Worker, WorkerHandle};
pub use crate::domain::{
    Canvas, Signature, TaskError, TaskFailure, TaskId, TaskState, chain, chord, group,
};
pub use crate::error::BobbinError;
pub use crate::typed::{Call, TaskContext, TaskOptions};

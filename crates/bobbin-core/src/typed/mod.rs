//! Typed - ハンドラ登録とメッセージ codec
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait - 引数を型で受け取る
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, `Call` を受け取る
//!
//! ワーカーは `TaskRegistry` から `DynHandler` だけを見ます。

pub mod codec;
pub mod context;
pub mod handler;
pub mod registry;
pub mod task;

pub use self::codec::{CodecError, MessageCodec};
pub use self::context::{Call, TaskContext};
pub use self::handler::{DynHandler, FnHandler, Handler, TypedHandler, handler_fn};
pub use self::registry::{RegistryError, TaskDefinition, TaskOptions, TaskRegistry};
pub use self::task::Task;

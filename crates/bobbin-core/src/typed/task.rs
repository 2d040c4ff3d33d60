//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const NAME`)
//! - Associated Types (`type Output`)

use serde::Serialize;

use super::context::Call;
use crate::domain::TaskError;

/// Task は task 名と引数の型を対応付ける
///
/// # 使用例
/// ```ignore
/// struct Add { x: i64, y: i64 }
///
/// impl Task for Add {
///     const NAME: &'static str = "tasks.add";
///     type Output = i64;
///
///     fn from_call(call: &Call) -> Result<Self, TaskError> {
///         Ok(Add { x: call.arg(0)?, y: call.arg(1)? })
///     }
/// }
/// ```
pub trait Task: Sized + Send + Sync + 'static {
    /// # 命名規約
    /// - `{module}.{action}`
    /// - 例: `tasks.add`
    const NAME: &'static str;

    type Output: Serialize + Send;

    /// Extract typed arguments from the positional/keyword call.
    fn from_call(call: &Call) -> Result<Self, TaskError>;
}

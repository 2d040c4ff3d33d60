//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder / App**: 設定と ports のワイヤリング
//! - **Client**: canvas の送信と結果ハンドル
//! - **Worker**: dequeue → 実行 → 結果記録 → 後続の発火
//! - **Control**: revoke と inspect
//! - **AsyncResult / GroupResult**: 結果の待ち合わせ

pub mod builder;
pub mod client;
pub mod config;
pub mod control;
mod pool;
mod producer;
pub mod result;
pub mod retry;
pub mod routing;
pub mod worker;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::client::Client;
pub use self::config::{
    AppConfig, ConfigError, PoolStrategy, ResultConfig, RetryConfig, RouteConfig, WorkerConfig,
};
pub use self::control::Control;
pub use self::result::{
    AsyncResult, CanvasResult, ChordResult, GetOptions, GroupResult, ResultError,
};
pub use self::retry::RetryPolicy;
pub use self::routing::{Route, Router};
pub use self::worker::{Worker, WorkerHandle};

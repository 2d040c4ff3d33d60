//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryBroker**: priority / delay / 再配送を持つプロセス内 broker
//! - **InMemoryResultStore**: TTL 付きのプロセス内 result store
//!
//! どちらも `set_available(false)` で障害を模擬できます。

pub mod inmem_broker;
pub mod inmem_store;

pub use self::inmem_broker::InMemoryBroker;
pub use self::inmem_store::InMemoryResultStore;

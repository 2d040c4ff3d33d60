//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。broker と result store はワーカー間で
//! 共有される唯一の協調手段であり、ここで契約だけを定義します。
//!
//! - `Broker`: 名前付きキューへの配送（at-least-once）
//! - `ResultStore`: task id ごとの状態と chord barrier
//! - `Clock` / `IdGenerator`: テストで差し替えるための抽象

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod result_store;

pub use self::broker::{Broker, BrokerError, BrokerLease, EnqueueOptions};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::result_store::{
    BarrierTick, CasCounter, ResultStore, Revocation, StoreError, increment_with_cas,
};

//! Broker port - 名前付きキューへの配送
//!
//! broker は bytes だけを運びます（encode/decode は `typed::codec`）。
//!
//! # 配送の契約
//! - キューごとに FIFO（priority も delay も無い場合）
//! - at-least-once: ack されなかったメッセージは再配送される
//! - `delay` は broker が守る（期限前には dequeue されない）
//! - `priority` はヒントであり、無視する実装もあり得る

use std::time::Duration;

use async_trait::async_trait;

/// Broker への到達不能などインフラ側の失敗。タスクの失敗とは区別される。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("lease for queue {queue} is no longer held")]
    LeaseLost { queue: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Higher is dequeued first within one queue.
    pub priority: Option<u8>,
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: Option<u8>) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Option<Duration>) -> Self {
        self.delay = delay;
        self
    }
}

/// A dequeued message the worker owns until it calls `ack` or `requeue`.
///
/// Dropping a lease without either leaves the message unacknowledged; the
/// broker redelivers it once its visibility timeout passes.
#[async_trait]
pub trait BrokerLease: Send {
    fn queue(&self) -> &str;

    fn body(&self) -> &[u8];

    /// Remove the message for good.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Return the message to its queue for another delivery.
    async fn requeue(self: Box<Self>) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(
        &self,
        queue: &str,
        body: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for a message on any of `queues`.
    ///
    /// Queues are checked in the order given. `Ok(None)` means the wait
    /// timed out; callers use it to check for shutdown.
    async fn dequeue(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Box<dyn BrokerLease>>, BrokerError>;

    /// Ready plus scheduled messages, excluding unacknowledged ones.
    async fn queue_length(&self, queue: &str) -> Result<usize, BrokerError>;
}

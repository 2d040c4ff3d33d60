//! InMemoryBroker - 開発用・テスト用の broker
//!
//! # 実装詳細
//! - キューごとに ready heap（priority 降順、同じ priority なら到着順）
//! - delay 付きメッセージは scheduled heap（期限の早い順）で保持
//! - dequeue されたメッセージは unacked に移り、visibility timeout を過ぎると
//!   ready に戻る（at-least-once）
//! - `Notify` で待機中の dequeue を起こす

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::ports::{Broker, BrokerError, BrokerLease, EnqueueOptions};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Cap for delays too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// One message waiting in a ready heap.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyMessage {
    priority: u8,
    seq: u64,
    body: Vec<u8>,
}

impl Ord for ReadyMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority first, then lower seq (FIFO)
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delayed message. Reverse ordering so BinaryHeap acts as a min-heap.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledMessage {
    due: Instant,
    queue: String,
    message: ReadyMessage,
}

impl Ord for ScheduledMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.message.seq.cmp(&self.message.seq))
    }
}

impl PartialOrd for ScheduledMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    message: ReadyMessage,
    redeliver_at: Instant,
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: HashMap<String, BinaryHeap<ReadyMessage>>,
    scheduled: BinaryHeap<ScheduledMessage>,
    unacked: HashMap<u64, Unacked>,
    next_seq: u64,
    next_tag: u64,
}

impl BrokerState {
    fn push_ready(&mut self, queue: &str, message: ReadyMessage) {
        self.ready
            .entry(queue.to_string())
            .or_default()
            .push(message);
    }

    /// Move due scheduled messages and expired leases back to ready.
    fn promote(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.due > now {
                break;
            }
            if let Some(entry) = self.scheduled.pop() {
                self.push_ready(&entry.queue, entry.message);
            }
        }

        let expired: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.redeliver_at <= now)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in expired {
            if let Some(u) = self.unacked.remove(&tag) {
                debug!(queue = %u.queue, seq = u.message.seq, "redelivering unacked message");
                self.push_ready(&u.queue, u.message);
            }
        }
    }

    /// Earliest moment something may become ready.
    fn next_wake(&self) -> Option<Instant> {
        let scheduled = self.scheduled.peek().map(|s| s.due);
        let unacked = self.unacked.values().map(|u| u.redeliver_at).min();
        match (scheduled, unacked) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn take(&mut self, queues: &[String]) -> Option<(String, ReadyMessage)> {
        queues.iter().find_map(|queue| {
            self.ready
                .get_mut(queue)
                .and_then(BinaryHeap::pop)
                .map(|message| (queue.clone(), message))
        })
    }
}

/// In-memory broker.
///
/// # 使用例
/// ```ignore
/// let broker = InMemoryBroker::new();
/// broker.enqueue("celery", body, EnqueueOptions::default()).await?;
/// let lease = broker.dequeue(&["celery".into()], Duration::from_secs(1)).await?;
/// ```
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
        if available {
            self.notify.notify_waiters();
        }
    }

    /// Messages handed out but not yet acknowledged.
    pub async fn unacked_count(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Bodies currently ready on `queue`, in delivery order.
    pub async fn peek_ready(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        let Some(heap) = state.ready.get(queue) else {
            return Vec::new();
        };
        let mut messages = heap.clone().into_sorted_vec();
        messages.reverse();
        messages.into_iter().map(|m| m.body).collect()
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker is offline".into()))
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(
        &self,
        queue: &str,
        body: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<(), BrokerError> {
        self.check_available()?;
        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            let message = ReadyMessage {
                priority: options.priority.unwrap_or(0),
                seq,
                body,
            };
            match options.delay.filter(|d| !d.is_zero()) {
                Some(delay) => state.scheduled.push(ScheduledMessage {
                    due: Instant::now() + delay.min(FAR_FUTURE),
                    queue: queue.to_string(),
                    message,
                }),
                None => state.push_ready(queue, message),
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Box<dyn BrokerLease>>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_available()?;

            // enable() before inspecting state so an enqueue in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote(now);

                if let Some((queue, message)) = state.take(queues) {
                    let tag = state.next_tag;
                    state.next_tag += 1;
                    state.unacked.insert(
                        tag,
                        Unacked {
                            queue: queue.clone(),
                            message: message.clone(),
                            redeliver_at: now + self.visibility_timeout,
                        },
                    );
                    let lease = InMemoryLease {
                        tag,
                        queue,
                        body: message.body,
                        state: Arc::clone(&self.state),
                        notify: Arc::clone(&self.notify),
                    };
                    return Ok(Some(Box::new(lease)));
                }
                state.next_wake()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_wake.map_or(deadline, |w| w.min(deadline));
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn queue_length(&self, queue: &str) -> Result<usize, BrokerError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let ready = state.ready.get(queue).map_or(0, BinaryHeap::len);
        let scheduled = state.scheduled.iter().filter(|s| s.queue == queue).count();
        Ok(ready + scheduled)
    }
}

/// Lease implementation for InMemoryBroker.
struct InMemoryLease {
    tag: u64,
    queue: String,
    body: Vec<u8>,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl BrokerLease for InMemoryLease {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        match state.unacked.remove(&self.tag) {
            Some(_) => Ok(()),
            None => Err(BrokerError::LeaseLost { queue: self.queue }),
        }
    }

    async fn requeue(self: Box<Self>) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            let Some(u) = state.unacked.remove(&self.tag) else {
                return Err(BrokerError::LeaseLost { queue: self.queue });
            };
            state.push_ready(&u.queue, u.message);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

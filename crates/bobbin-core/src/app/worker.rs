//! Worker - タスク実行エンジン
//!
//! # フロー
//! 1. Semaphore で空きスロットを確保
//! 2. Broker::dequeue（poll timeout 付き、失敗時は指数バックオフ）
//! 3. decode（失敗したら dead-letter に送って ack）
//! 4. 実行タスクを spawn してから ack（handoff 完了）
//! 5. 期限切れ / ETA 前 / revoke / 未登録 を判定
//! 6. STARTED を書いて実行、soft / hard timeout と revoke(terminate) を監視
//! 7. SUCCESS → link 発火 → chord barrier、
//!    RETRY → 同じ id で再 enqueue、FAILURE → link_error 発火 → chord barrier
//!
//! broker / result store の障害はタスクの失敗にせず、バックオフして無期限に再試行します。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::builder::App;
use super::config::PoolStrategy;
use super::pool::{self, Execution, TaskFuture};
use super::producer::Parent;
use super::retry::RetryPolicy;
use crate::domain::{
    ActiveTask, Canvas, ChordCallback, ChordErrorPolicy, Envelope, FailureKind, GroupId,
    ResultRecord, Signature, TaskError, TaskFailure, TaskId, WorkerSnapshot,
};
use crate::domain::envelope::eta_after;
use crate::error::BobbinError;
use crate::ports::{BrokerLease, Revocation};
use crate::typed::context::ProgressSink;
use crate::typed::{Call, CodecError, TaskContext, TaskDefinition};

/// Worker builder. Defaults come from `[worker]` in the app config.
pub struct Worker {
    app: App,
    hostname: String,
    queues: Vec<String>,
    concurrency: usize,
    pool: PoolStrategy,
}

impl Worker {
    pub(crate) fn new(app: App) -> Self {
        let config = &app.config;
        Self {
            hostname: config.hostname(),
            queues: config.worker_queues(),
            concurrency: config.worker.concurrency,
            pool: config.worker.pool,
            app,
        }
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Consumed queues, highest precedence first.
    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn pool(mut self, pool: PoolStrategy) -> Self {
        self.pool = pool;
        self
    }

    /// Starts the worker in the background.
    pub fn start(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let hostname = self.hostname.clone();
        let handle = tokio::spawn(self.run(shutdown.clone()));
        WorkerHandle {
            hostname,
            handle,
            shutdown,
        }
    }

    /// Consume until `shutdown` is cancelled, then drain in-flight tasks.
    pub async fn run(self, shutdown: CancellationToken) {
        let config = Arc::clone(&self.app.config);
        let shared = Arc::new(WorkerShared {
            backoff: RetryPolicy::new(
                Duration::from_millis(config.worker.backoff_initial_ms),
                2.0,
                Duration::from_millis(config.worker.backoff_max_ms),
            ),
            app: self.app,
            hostname: self.hostname,
            queues: self.queues,
            concurrency: self.concurrency,
            pool: self.pool,
            active: Mutex::new(HashMap::new()),
        });

        info!(
            hostname = %shared.hostname,
            queues = ?shared.queues,
            concurrency = shared.concurrency,
            pool = ?shared.pool,
            "worker started"
        );

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&shared),
            shutdown.child_token(),
        ));

        let semaphore = Arc::new(Semaphore::new(shared.concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut dequeue_failures = 0u32;
        let poll_timeout = config.worker.poll_timeout();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "task supervisor crashed");
                }
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("worker semaphore closed unexpectedly");
                        break;
                    }
                },
            };

            let dequeued = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                dequeued = shared.app.broker.dequeue(&shared.queues, poll_timeout) => dequeued,
            };

            let lease = match dequeued {
                Ok(Some(lease)) => {
                    dequeue_failures = 0;
                    lease
                }
                Ok(None) => continue,
                Err(e) => {
                    dequeue_failures = dequeue_failures.saturating_add(1);
                    let delay = shared.backoff.next_delay(dequeue_failures);
                    warn!(error = %e, ?delay, "dequeue failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            let envelope = match shared.app.codec.decode(lease.body()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    shared.dead_letter(lease, e).await;
                    continue;
                }
            };

            let span = info_span!(
                "task",
                task.id = %envelope.id,
                task.name = %envelope.task,
                retries = envelope.retries,
            );
            let queue = lease.queue().to_string();
            let task_shared = Arc::clone(&shared);
            in_flight.spawn(
                async move {
                    let _permit = permit;
                    task_shared.process(envelope, queue).await;
                }
                .instrument(span),
            );

            if let Err(e) = lease.ack().await {
                warn!(error = %e, "ack failed, message may be delivered again");
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "waiting for in-flight tasks");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task supervisor crashed");
            }
        }
        let _ = heartbeat.await;
        shared.publish_snapshot().await;
        info!(hostname = %shared.hostname, "worker stopped");
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    hostname: String,
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl WorkerHandle {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop dequeuing and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "worker task ended abnormally");
        }
    }
}

async fn heartbeat_loop(shared: Arc<WorkerShared>, token: CancellationToken) {
    let mut tick = tokio::time::interval(shared.app.config.worker.heartbeat());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => shared.publish_snapshot().await,
        }
    }
}

/// Why the supervisor killed an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    HardTimeout,
    SoftTimeoutGrace,
    Terminated,
}

struct Supervised {
    execution: Execution,
    stop: Option<StopReason>,
    terminated: bool,
}

enum Outcome {
    Success(Value),
    Retry {
        countdown: Option<Duration>,
        cause: String,
    },
    Failure(TaskFailure),
}

struct WorkerShared {
    app: App,
    hostname: String,
    queues: Vec<String>,
    concurrency: usize,
    pool: PoolStrategy,
    backoff: RetryPolicy,
    active: Mutex<HashMap<TaskId, ActiveTask>>,
}

impl WorkerShared {
    async fn process(self: Arc<Self>, envelope: Envelope, queue: String) {
        let now = self.app.clock.now();

        if envelope.is_expired(now) {
            info!("task expired before it could run");
            let failure = TaskFailure::new(FailureKind::Revoked, "expired");
            self.on_failure(&envelope, failure).await;
            return;
        }

        if let Some(delay) = envelope.delay_from(now) {
            debug!(?delay, "eta not reached, re-enqueueing");
            self.republish(&envelope, &queue).await;
            return;
        }

        let revocation = self
            .with_backoff("revocation lookup", || async {
                Ok(self.app.store.revocation(envelope.id).await?)
            })
            .await;
        if matches!(revocation, Some(Some(_))) {
            info!("task revoked, skipping");
            let failure = TaskFailure::new(FailureKind::Revoked, "revoked");
            self.on_failure(&envelope, failure).await;
            return;
        }

        let definition = match self.app.registry.resolve(&envelope.task) {
            Ok(definition) => definition,
            Err(e) => {
                error!(error = %e, "unknown task");
                let failure = TaskFailure::new(FailureKind::TaskNotFound, e.to_string());
                self.on_failure(&envelope, failure).await;
                return;
            }
        };

        self.write_record(
            ResultRecord::started(envelope.id)
                .with_task(envelope.task.clone(), envelope.retries)
                .with_worker(self.hostname.clone()),
        )
        .await;
        self.track(&envelope, true).await;
        info!("task started");

        let supervised = self.supervise(&envelope, &definition).await;
        self.track(&envelope, false).await;

        match self.classify(&definition, supervised) {
            Outcome::Success(value) => self.on_success(&envelope, value).await,
            Outcome::Retry { countdown, cause } => {
                self.retry_or_fail(&envelope, &definition, &queue, countdown, cause)
                    .await
            }
            Outcome::Failure(failure) => self.on_failure(&envelope, failure).await,
        }
    }

    fn max_retries(&self, definition: &TaskDefinition) -> u32 {
        definition
            .options
            .max_retries
            .unwrap_or(self.app.config.default_max_retries)
    }

    async fn supervise(&self, envelope: &Envelope, definition: &TaskDefinition) -> Supervised {
        let soft = CancellationToken::new();
        let kill = CancellationToken::new();
        let progress = ProgressSink {
            store: Arc::clone(&self.app.store),
            ttl: self.app.config.result_ttl(),
            task: envelope.task.clone(),
            worker: self.hostname.clone(),
        };
        let ctx = TaskContext::new(
            envelope.id,
            envelope.task.clone(),
            envelope.retries,
            self.max_retries(definition),
            soft.clone(),
            Some(progress),
        );
        let call = Call::new(envelope.args.clone(), envelope.kwargs.clone());
        let handler = Arc::clone(&definition.handler);
        let fut: TaskFuture = Box::pin(async move { handler.call(ctx, call).await });

        let execution = pool::execute(self.pool, fut, kill.clone());
        tokio::pin!(execution);

        let started = Instant::now();
        let grace = self.app.config.worker.soft_timeout_grace();
        let mut soft_at = definition.options.soft_timeout.map(|d| started + d);
        let mut kill_at = definition.options.hard_timeout.map(|d| started + d);
        let mut reason = kill_at.map(|_| StopReason::HardTimeout);
        let revoke_every = self.app.config.worker.revoke_poll();
        let mut revoke_check = tokio::time::interval_at(started + revoke_every, revoke_every);
        let mut stop = None;
        let mut terminated = false;

        loop {
            tokio::select! {
                out = &mut execution => {
                    return Supervised { execution: out, stop, terminated };
                }
                _ = sleep_until(soft_at) => {
                    soft_at = None;
                    warn!(limit = ?definition.options.soft_timeout, "soft time limit exceeded");
                    soft.cancel();
                    let grace_at = Instant::now() + grace;
                    if kill_at.is_none_or(|k| grace_at < k) {
                        kill_at = Some(grace_at);
                        reason = Some(StopReason::SoftTimeoutGrace);
                    }
                }
                _ = sleep_until(kill_at) => {
                    kill_at = None;
                    stop = reason.take();
                    warn!(reason = ?stop, "killing task execution");
                    kill.cancel();
                }
                _ = revoke_check.tick(), if !terminated && stop.is_none() => {
                    match self.app.store.revocation(envelope.id).await {
                        Ok(Some(Revocation { terminate: true })) => {
                            info!("terminate requested");
                            terminated = true;
                            soft.cancel();
                            let grace_at = Instant::now() + grace;
                            if kill_at.is_none_or(|k| grace_at < k) {
                                kill_at = Some(grace_at);
                            }
                            reason = Some(StopReason::Terminated);
                        }
                        Ok(_) => {}
                        Err(e) => debug!(error = %e, "revocation check failed"),
                    }
                }
            }
        }
    }

    fn classify(&self, definition: &TaskDefinition, supervised: Supervised) -> Outcome {
        let Supervised {
            execution,
            stop,
            terminated,
        } = supervised;
        match execution {
            Execution::Finished(Ok(value)) => Outcome::Success(value),
            Execution::Finished(Err(_)) | Execution::Killed if terminated => Outcome::Failure(
                TaskFailure::new(FailureKind::Revoked, "terminated by revoke request"),
            ),
            Execution::Finished(Err(TaskError::Retry { countdown, cause })) => {
                Outcome::Retry { countdown, cause }
            }
            Execution::Finished(Err(TaskError::Failed(message))) if definition.options.autoretry => {
                Outcome::Retry {
                    countdown: None,
                    cause: message,
                }
            }
            Execution::Finished(Err(TaskError::Failed(message))) => {
                Outcome::Failure(TaskFailure::new(FailureKind::HandlerError, message))
            }
            Execution::Finished(Err(TaskError::SoftTimeout)) => Outcome::Failure(
                TaskFailure::new(FailureKind::SoftTimeout, "soft time limit exceeded"),
            ),
            Execution::Panicked(message) => Outcome::Failure(TaskFailure::new(
                FailureKind::HandlerError,
                format!("handler panicked: {message}"),
            )),
            Execution::Killed => {
                let message = match (stop, definition.options.hard_timeout) {
                    (Some(StopReason::HardTimeout), Some(limit)) => {
                        format!("hard time limit ({limit:?}) exceeded")
                    }
                    (Some(StopReason::SoftTimeoutGrace), _) => format!(
                        "did not stop within {:?} of the soft time limit",
                        self.app.config.worker.soft_timeout_grace()
                    ),
                    _ => "execution killed".to_string(),
                };
                Outcome::Failure(TaskFailure::new(FailureKind::HardTimeoutKill, message))
            }
        }
    }

    async fn retry_or_fail(
        &self,
        envelope: &Envelope,
        definition: &TaskDefinition,
        queue: &str,
        countdown: Option<Duration>,
        cause: String,
    ) {
        let max_retries = self.max_retries(definition);
        if envelope.retries >= max_retries {
            warn!(max_retries, cause = %cause, "max retries exceeded");
            let failure = TaskFailure::new(
                FailureKind::MaxRetriesExceeded,
                format!("max retries ({max_retries}) exceeded"),
            )
            .with_cause(TaskFailure::new(FailureKind::HandlerError, cause));
            self.on_failure(envelope, failure).await;
            return;
        }

        let delay = countdown.unwrap_or_else(|| {
            self.app
                .config
                .retry_policy()
                .next_delay(envelope.retries + 1)
        });
        let eta = eta_after(self.app.clock.now(), delay);
        let next = envelope.retry_copy(eta);

        self.write_record(
            ResultRecord::retry(
                envelope.id,
                json!({
                    "cause": cause,
                    "countdown_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "next_retries": next.retries,
                }),
            )
            .with_task(envelope.task.clone(), envelope.retries)
            .with_worker(self.hostname.clone()),
        )
        .await;

        let retry_queue = definition.options.queue.as_deref().unwrap_or(queue);
        warn!(?delay, retries = next.retries, cause = %cause, "retry scheduled");
        self.republish(&next, retry_queue).await;
    }

    async fn on_success(&self, envelope: &Envelope, value: Value) {
        self.write_record(
            ResultRecord::success(envelope.id, value.clone(), self.app.clock.now())
                .with_task(envelope.task.clone(), envelope.retries)
                .with_worker(self.hostname.clone()),
        )
        .await;
        info!("task succeeded");

        for next in &envelope.link {
            self.dispatch(next, Parent::new(&value, Some(envelope.id)))
                .await;
        }
        self.chord_step(envelope).await;
    }

    /// Record a terminal failure (FAILURE or REVOKED), fire errbacks and
    /// account for the chord barrier.
    async fn on_failure(&self, envelope: &Envelope, failure: TaskFailure) {
        if failure.kind == FailureKind::Revoked {
            info!(reason = %failure.message, "task revoked");
        } else {
            error!(kind = ?failure.kind, message = %failure.message, "task failed");
        }
        let marker = failure.to_marker();
        self.write_record(
            ResultRecord::failure(envelope.id, failure, self.app.clock.now())
                .with_task(envelope.task.clone(), envelope.retries)
                .with_worker(self.hostname.clone()),
        )
        .await;

        for errback in &envelope.link_error {
            self.dispatch(errback, Parent::new(&marker, Some(envelope.id)))
                .await;
        }
        self.chord_step(envelope).await;
    }

    /// Count this header member and, on the last one, fire or fail the callback.
    async fn chord_step(&self, envelope: &Envelope) {
        let (Some(group_id), Some(chord_size)) = (envelope.group_id, envelope.chord_size) else {
            return;
        };
        let ttl = self.app.config.result_ttl();
        let Some(tick) = self
            .with_backoff("chord barrier", || async {
                Ok(self
                    .app
                    .store
                    .increment_and_check(group_id, envelope.id, chord_size, ttl)
                    .await?)
            })
            .await
        else {
            return;
        };
        debug!(group.id = %group_id, count = tick.count, chord_size, "chord barrier");
        if !tick.is_last {
            return;
        }

        let meta = self
            .with_backoff("chord metadata", || async {
                Ok(self.app.store.get_group(group_id).await?)
            })
            .await
            .flatten();
        let Some(callback) = meta.as_ref().and_then(|m| m.callback.clone()) else {
            error!(group.id = %group_id, "chord metadata missing, callback not fired");
            return;
        };
        let members = meta.map(|m| m.members).unwrap_or_default();
        self.fire_chord_callback(group_id, &members, callback).await;
    }

    async fn fire_chord_callback(&self, group_id: GroupId, members: &[TaskId], callback: ChordCallback) {
        let mut values = Vec::with_capacity(members.len());
        let mut first_failure = None;
        for id in members {
            let record = self
                .with_backoff("chord member result", || async {
                    Ok(self.app.store.get_status(*id).await?)
                })
                .await
                .flatten()
                .unwrap_or_else(|| ResultRecord::pending(*id));
            if record.state.is_failure() && first_failure.is_none() {
                first_failure = Some(record.recorded_failure());
            }
            let value = record.outcome_value().unwrap_or_else(|| {
                TaskFailure::new(
                    FailureKind::ChordError,
                    format!("member {id} has no terminal result"),
                )
                .to_marker()
            });
            values.push(value);
        }

        match (callback.policy, first_failure) {
            (ChordErrorPolicy::FailFast, Some(failure)) => {
                warn!(group.id = %group_id, "chord member failed, callback not run");
                self.fail_chord_body(&callback.body, failure).await;
            }
            _ => {
                info!(group.id = %group_id, members = members.len(), "firing chord callback");
                let results = Value::Array(values);
                self.dispatch(&callback.body, Parent::new(&results, None))
                    .await;
            }
        }
    }

    /// Fail-fast: record `ChordError` under the callback's entry ids and
    /// fire their errbacks.
    async fn fail_chord_body(&self, body: &Canvas, cause: TaskFailure) {
        for sig in entry_signatures(body) {
            let Some(id) = sig.id() else {
                continue;
            };
            let failure = TaskFailure::new(
                FailureKind::ChordError,
                format!("chord header member failed: {}", cause.message),
            )
            .with_cause(cause.clone());
            let marker = failure.to_marker();
            self.write_record(
                ResultRecord::failure(id, failure, self.app.clock.now())
                    .with_task(sig.task.clone(), 0)
                    .with_worker(self.hostname.clone()),
            )
            .await;
            for errback in &sig.options.link_error {
                self.dispatch(errback, Parent::new(&marker, Some(id))).await;
            }
        }
    }

    async fn dispatch(&self, canvas: &Canvas, parent: Parent<'_>) {
        self.with_backoff("dispatch continuation", || self.app.dispatch(canvas, parent))
            .await;
    }

    async fn republish(&self, envelope: &Envelope, queue: &str) {
        self.with_backoff("re-enqueue", || self.app.publish(envelope, Some(queue)))
            .await;
    }

    async fn write_record(&self, record: ResultRecord) {
        let ttl = self.app.config.result_ttl();
        self.with_backoff("write result", || {
            let record = record.clone();
            async move { Ok(self.app.store.set_status(record, ttl).await?) }
        })
        .await;
    }

    /// Run `op` until it succeeds, backing off on outages forever. Other
    /// errors are logged and yield `None`.
    async fn with_backoff<T, F, Fut>(&self, what: &'static str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BobbinError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Some(value),
                Err(e) if e.is_transient() => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff.next_delay(attempt);
                    warn!(what, error = %e, ?delay, "infrastructure unavailable, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(what, error = %e, "giving up");
                    return None;
                }
            }
        }
    }

    async fn dead_letter(&self, lease: Box<dyn BrokerLease>, err: CodecError) {
        error!(queue = lease.queue(), error = %err, "poison message");
        if let Some(dlq) = &self.app.config.dead_letter_queue {
            let body = lease.body().to_vec();
            self.with_backoff("dead-letter", || {
                let body = body.clone();
                async move {
                    Ok(self
                        .app
                        .broker
                        .enqueue(dlq, body, Default::default())
                        .await?)
                }
            })
            .await;
        }
        if let Err(e) = lease.ack().await {
            warn!(error = %e, "ack of poison message failed");
        }
    }

    async fn track(&self, envelope: &Envelope, running: bool) {
        {
            let mut active = self.active.lock().await;
            if running {
                active.insert(
                    envelope.id,
                    ActiveTask {
                        task_id: envelope.id,
                        task: envelope.task.clone(),
                        retries: envelope.retries,
                        started_at: self.app.clock.now(),
                    },
                );
            } else {
                active.remove(&envelope.id);
            }
        }
        self.publish_snapshot().await;
    }

    /// Best effort: inspection data is advisory.
    async fn publish_snapshot(&self) {
        let mut active: Vec<ActiveTask> = self.active.lock().await.values().cloned().collect();
        active.sort_by_key(|a| a.started_at);
        let snapshot = WorkerSnapshot {
            hostname: self.hostname.clone(),
            queues: self.queues.clone(),
            concurrency: self.concurrency,
            registered: self.app.registry.names(),
            active,
            updated_at: self.app.clock.now(),
        };
        let ttl = Some(self.app.config.worker.heartbeat() * 3);
        if let Err(e) = self.app.store.save_worker_snapshot(snapshot, ttl).await {
            debug!(error = %e, "worker snapshot not saved");
        }
    }
}

/// Signatures that run first when `canvas` is dispatched.
fn entry_signatures(canvas: &Canvas) -> Vec<&Signature> {
    match canvas {
        Canvas::Task(sig) => vec![sig],
        Canvas::Group(group) => group.tasks.iter().collect(),
        Canvas::Chord(chord) if chord.header.is_empty() => entry_signatures(&chord.body),
        Canvas::Chord(chord) => chord.header.tasks.iter().collect(),
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

//! Producer - canvas を envelope に展開して broker に送る
//!
//! client（最初の送信）と worker（link / link_error / chord callback の発火）が
//! 同じ経路を使います。
//!
//! - Task: 1 envelope。`link` はそのまま envelope に載る
//! - Group: `GroupMeta` を保存してからメンバーを一斉に enqueue
//! - Chord: callback を `GroupMeta` に保存し、メンバーに `chord_size` を付ける。
//!   header が空なら callback を `[]` で即座に発火

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tracing::debug;

use super::builder::App;
use super::routing::Route;
use crate::domain::{Canvas, ChordCallback, Envelope, Group, GroupMeta, Signature, TaskId};
use crate::error::BobbinError;
use crate::ports::EnqueueOptions;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Value handed to a continuation, and who produced it.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Parent<'a> {
    pub(crate) value: Option<&'a Value>,
    pub(crate) id: Option<TaskId>,
}

impl<'a> Parent<'a> {
    pub(crate) fn new(value: &'a Value, id: Option<TaskId>) -> Self {
        Self {
            value: Some(value),
            id,
        }
    }
}

impl App {
    /// Send `canvas`, binding `parent.value` into its first step(s).
    pub(crate) fn dispatch<'a>(
        &'a self,
        canvas: &'a Canvas,
        parent: Parent<'a>,
    ) -> BoxFuture<'a, Result<(), BobbinError>> {
        Box::pin(async move {
            match canvas {
                Canvas::Task(sig) => self.dispatch_signature(sig, parent).await,
                Canvas::Group(group) => self.dispatch_group(group, None, parent).await,
                Canvas::Chord(chord) => {
                    if chord.header.is_empty() {
                        debug!("empty chord header, firing callback with []");
                        let empty = Value::Array(Vec::new());
                        return self
                            .dispatch(&chord.body, Parent::new(&empty, parent.id))
                            .await;
                    }
                    let callback = ChordCallback {
                        body: (*chord.body).clone(),
                        policy: chord.policy.unwrap_or(self.config.chord_error_policy),
                    };
                    self.dispatch_group(&chord.header, Some(callback), parent)
                        .await
                }
            }
        })
    }

    async fn dispatch_signature(
        &self,
        sig: &Signature,
        parent: Parent<'_>,
    ) -> Result<(), BobbinError> {
        let id = sig.id().unwrap_or_else(|| self.ids.generate_task_id());
        let envelope = Envelope::from_signature(sig.bind(parent.value), id, self.clock.now())
            .with_parent(parent.id);
        self.publish(&envelope, sig.options.queue.as_deref()).await
    }

    async fn dispatch_group(
        &self,
        group: &Group,
        callback: Option<ChordCallback>,
        parent: Parent<'_>,
    ) -> Result<(), BobbinError> {
        if group.is_empty() {
            return Ok(());
        }
        let group_id = group
            .group_id
            .unwrap_or_else(|| self.ids.generate_group_id());
        let members: Vec<(TaskId, &Signature)> = group
            .tasks
            .iter()
            .map(|sig| (sig.id().unwrap_or_else(|| self.ids.generate_task_id()), sig))
            .collect();
        let chord_size = callback.as_ref().map(|_| members.len());

        // membership must exist before any member can finish
        let meta = GroupMeta {
            group_id,
            members: members.iter().map(|(id, _)| *id).collect(),
            callback,
        };
        self.store.save_group(meta, self.config.result_ttl()).await?;

        let now = self.clock.now();
        for (index, (id, sig)) in members.into_iter().enumerate() {
            let envelope = Envelope::from_signature(sig.bind(parent.value), id, now)
                .in_group(group_id, index, chord_size)
                .with_parent(parent.id);
            self.publish(&envelope, sig.options.queue.as_deref()).await?;
        }
        Ok(())
    }

    /// Route, encode and enqueue one envelope.
    pub(crate) async fn publish(
        &self,
        envelope: &Envelope,
        queue: Option<&str>,
    ) -> Result<(), BobbinError> {
        let route = self.route_for(&envelope.task, queue);
        let body = self.codec.encode(envelope)?;
        let options = EnqueueOptions::default()
            .with_priority(envelope.priority.or(route.priority))
            .with_delay(envelope.delay_from(self.clock.now()));
        self.broker.enqueue(&route.queue, body, options).await?;
        debug!(
            task.id = %envelope.id,
            task.name = %envelope.task,
            queue = %route.queue,
            "envelope published"
        );
        Ok(())
    }

    /// Explicit queue > routing table > task default queue > `default_queue`.
    pub(crate) fn route_for(&self, task: &str, explicit: Option<&str>) -> Route {
        if let Some(queue) = explicit {
            return Route {
                queue: queue.to_string(),
                priority: None,
            };
        }
        let task_queue = self
            .registry
            .resolve(task)
            .ok()
            .and_then(|def| def.options.queue.clone());
        self.router.route(task, task_queue.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::app::{AppBuilder, AppConfig, RouteConfig};
    use crate::domain::{chord, group};
    use crate::impls::{InMemoryBroker, InMemoryResultStore};
    use crate::ports::{Broker, ResultStore};
    use crate::typed::MessageCodec;

    struct Fixture {
        app: App,
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryResultStore>,
    }

    fn fixture(config: AppConfig) -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(InMemoryResultStore::new());
        let app = AppBuilder::new(config)
            .broker(broker.clone())
            .result_store(store.clone())
            .build()
            .unwrap();
        Fixture { app, broker, store }
    }

    async fn ready_envelopes(broker: &InMemoryBroker, queue: &str) -> Vec<Envelope> {
        broker
            .peek_ready(queue)
            .await
            .iter()
            .map(|b| MessageCodec.decode(b).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn chain_enqueues_only_first_step() {
        let f = fixture(AppConfig::default());
        let canvas = Canvas::from(Signature::new("double").arg(5))
            .then(Signature::new("increment"))
            .freeze(f.app.ids.as_ref());

        f.app.dispatch(&canvas, Parent::default()).await.unwrap();

        let envs = ready_envelopes(&f.broker, "celery").await;
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].task, "double");
        assert_eq!(envs[0].link.len(), 1);
    }

    #[tokio::test]
    async fn group_saves_membership_before_members() {
        let f = fixture(AppConfig::default());
        let canvas = Canvas::from(group([Signature::new("a"), Signature::new("b")]))
            .freeze(f.app.ids.as_ref());
        let Canvas::Group(g) = &canvas else {
            unreachable!()
        };

        f.app.dispatch(&canvas, Parent::default()).await.unwrap();

        let meta = f.store.get_group(g.group_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(meta.members.len(), 2);
        assert!(meta.callback.is_none());

        let envs = ready_envelopes(&f.broker, "celery").await;
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[1].group_index, Some(1));
        assert_eq!(envs[1].chord_size, None);
    }

    #[tokio::test]
    async fn chord_members_carry_chord_size() {
        let f = fixture(AppConfig::default());
        let canvas = Canvas::from(chord(
            [Signature::new("a"), Signature::new("b"), Signature::new("c")],
            Signature::new("sum"),
        ))
        .freeze(f.app.ids.as_ref());

        f.app.dispatch(&canvas, Parent::default()).await.unwrap();

        let envs = ready_envelopes(&f.broker, "celery").await;
        assert!(envs.iter().all(|e| e.chord_size == Some(3)));
        let meta = f
            .store
            .get_group(envs[0].group_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.chord_size(), Some(3));
    }

    #[tokio::test]
    async fn empty_chord_fires_callback_with_empty_list() {
        let f = fixture(AppConfig::default());
        let canvas = Canvas::from(chord(Vec::<Signature>::new(), Signature::new("sum")))
            .freeze(f.app.ids.as_ref());

        f.app.dispatch(&canvas, Parent::default()).await.unwrap();

        let envs = ready_envelopes(&f.broker, "celery").await;
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].task, "sum");
        assert_eq!(envs[0].args, vec![json!([])]);
    }

    #[tokio::test]
    async fn routing_precedence() {
        let mut config = AppConfig::default();
        config.routes.push(RouteConfig {
            pattern: "video.*".into(),
            queue: "video".into(),
            priority: Some(7),
        });
        let f = fixture(config);

        let routed = Canvas::from(Signature::new("video.encode")).freeze(f.app.ids.as_ref());
        let explicit = Canvas::from(Signature::new("video.encode").queue("urgent"))
            .freeze(f.app.ids.as_ref());
        f.app.dispatch(&routed, Parent::default()).await.unwrap();
        f.app.dispatch(&explicit, Parent::default()).await.unwrap();

        assert_eq!(f.broker.queue_length("video").await.unwrap(), 1);
        assert_eq!(f.broker.queue_length("urgent").await.unwrap(), 1);
        assert_eq!(f.broker.queue_length("celery").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn countdown_is_delayed_in_the_broker() {
        let f = fixture(AppConfig::default());
        let canvas = Canvas::from(Signature::new("later").countdown(Duration::from_secs(60)))
            .freeze(f.app.ids.as_ref());
        f.app.dispatch(&canvas, Parent::default()).await.unwrap();

        assert_eq!(f.broker.queue_length("celery").await.unwrap(), 1);
        assert!(f.broker.peek_ready("celery").await.is_empty());
    }

    #[tokio::test]
    async fn parent_value_is_bound_into_group_members() {
        let f = fixture(AppConfig::default());
        let canvas = Canvas::from(group([Signature::new("a"), Signature::new("b").arg(1)]))
            .freeze(f.app.ids.as_ref());
        let parent_id = TaskId::generate();
        let value = json!(10);

        f.app
            .dispatch(&canvas, Parent::new(&value, Some(parent_id)))
            .await
            .unwrap();

        let envs = ready_envelopes(&f.broker, "celery").await;
        assert_eq!(envs[0].args, vec![json!(10)]);
        assert_eq!(envs[1].args, vec![json!(10), json!(1)]);
        assert!(envs.iter().all(|e| e.parent_id == Some(parent_id)));
    }
}

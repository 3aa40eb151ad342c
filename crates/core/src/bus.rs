//! Message bus abstraction and the in-process implementation.
//!
//! The engine only needs publish and grouped subscribe with opaque string
//! payloads; any broker that offers those semantics can sit behind this
//! trait. [`InMemoryBus`] serves tests and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use crate::error::{BelfryError, Result};

/// Topic names used by the pipeline.
pub mod topics {
    /// Fan-out of a claimed minute slice: one message per shard,
    /// payload `"<shard>_<YYYY-MM-DD HH:MM>"`.
    pub const BUCKET_READY: &str = "belfry.bucket_ready";
    /// One message per due timer, payload is the definition ID.
    pub const TIMER_FIRE: &str = "belfry.timer_fire";
    /// Out-of-band callback-failure alerts for creators.
    pub const ALERT: &str = "belfry.alert";
}

/// Async message handler. Returning an error leaves redelivery policy to
/// the bus implementation; the in-memory bus only logs it.
pub type MessageHandler = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle to a running consumer; closing it stops delivery.
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// Opaque publish/consume interface over the message broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload to a topic; returns the broker message ID.
    async fn publish(&self, topic: &str, payload: &str) -> Result<String>;

    /// Subscribe a handler within a consumer group. Messages on a topic are
    /// load-balanced across consumers of the same group and fanned out
    /// across groups.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn ConsumerHandle>>;
}

pub type DynMessageBus = Arc<dyn MessageBus>;

type GroupQueue = (
    mpsc::UnboundedSender<String>,
    Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
);

/// In-process bus with consumer-group semantics: one queue per
/// `(topic, group)`, publishes fan out across groups, consumers within a
/// group compete for messages.
#[derive(Default)]
pub struct InMemoryBus {
    queues: Mutex<HashMap<String, HashMap<String, GroupQueue>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

struct InMemoryConsumer {
    running: Arc<AtomicBool>,
    closed: Arc<Notify>,
}

#[async_trait]
impl ConsumerHandle for InMemoryConsumer {
    async fn close(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a consumer between recv calls still
        // observes the close on its next select.
        self.closed.notify_one();
        Ok(())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<String> {
        let queues = self.queues.lock().await;
        if let Some(groups) = queues.get(topic) {
            for (group, (tx, _)) in groups {
                if tx.send(payload.to_string()).is_err() {
                    tracing::debug!(topic = %topic, group = %group, "Dropped message for closed group");
                }
            }
        }
        Ok(Uuid::new_v4().to_string())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn ConsumerHandle>> {
        let rx = {
            let mut queues = self.queues.lock().await;
            let groups = queues.entry(topic.to_string()).or_default();
            let (_, rx) = groups.entry(group.to_string()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Arc::new(Mutex::new(rx)))
            });
            rx.clone()
        };

        let running = Arc::new(AtomicBool::new(true));
        let closed = Arc::new(Notify::new());
        let consumer_running = running.clone();
        let consumer_closed = closed.clone();
        let topic_name = topic.to_string();

        tokio::spawn(async move {
            while consumer_running.load(Ordering::SeqCst) {
                let message = {
                    let mut rx = rx.lock().await;
                    tokio::select! {
                        msg = rx.recv() => msg,
                        _ = consumer_closed.notified() => None,
                    }
                };
                let Some(payload) = message else { break };
                if let Err(e) = handler(payload).await {
                    tracing::error!(topic = %topic_name, error = %e, "Message handler failed");
                }
            }
            tracing::debug!(topic = %topic_name, "Consumer stopped");
        });

        Ok(Box::new(InMemoryConsumer { running, closed }))
    }
}

/// A bus wrapper that fails every publish; used to exercise partial
/// fan-out handling in tests.
#[cfg(test)]
pub(crate) struct FailingBus;

#[cfg(test)]
#[async_trait]
impl MessageBus for FailingBus {
    async fn publish(&self, _topic: &str, _payload: &str) -> Result<String> {
        Err(BelfryError::Bus("publish refused".to_string()))
    }

    async fn subscribe(
        &self,
        _topic: &str,
        _group: &str,
        _handler: MessageHandler,
    ) -> Result<Box<dyn ConsumerHandle>> {
        Err(BelfryError::Bus("subscribe refused".to_string()))
    }
}

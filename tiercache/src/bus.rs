//! Invalidation bus
//!
//! Decouples invalidation producers from every process's coordinator.
//! Publishing only waits for the transport to accept the message; delivery
//! happens on a dedicated dispatch task per [`Subscription`]. Delivery is
//! at-least-once and unordered across keys, so handlers must be idempotent.

use crate::error::{CacheError, Level, Result, TransportError};
use crate::types::{BusMessage, CacheKey, InvalidationMessage};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stream of raw messages for one subscription
pub type BusStream = Pin<Box<dyn Stream<Item = BusMessage> + Send>>;

/// Publish/subscribe primitive addressed by topic
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> std::result::Result<(), TransportError>;

    /// Resolves once the subscription is live; dropping the stream releases it
    async fn subscribe(&self, topic: &str) -> std::result::Result<BusStream, TransportError>;
}

/// Region-addressed invalidation channel
#[derive(Clone)]
pub struct InvalidationBus {
    transport: Arc<dyn BusTransport>,
    timeout: Duration,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl InvalidationBus {
    pub fn new(transport: Arc<dyn BusTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(5),
        }
    }

    /// Backoff used to resubscribe once a subscription stream ends
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max.max(initial);
        self
    }

    /// Broadcast "evict `key`" on `topic`
    pub async fn publish(&self, topic: &str, key: &CacheKey) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.transport.publish(topic, key.to_wire())).await
        {
            Ok(Ok(())) => {
                debug!("Published invalidation for key {} on {}", key, topic);
                Ok(())
            }
            Ok(Err(e)) => Err(CacheError::unavailable(
                Level::Bus,
                format!("publish failed: {}", e),
            )),
            Err(_) => Err(CacheError::unavailable(
                Level::Bus,
                format!("publish timed out after {:?}", self.timeout),
            )),
        }
    }

    /// Register `handler` for every message delivered on `topic`
    pub async fn subscribe<H>(&self, topic: &str, handler: H) -> Result<Subscription>
    where
        H: Fn(InvalidationMessage) + Send + Sync + 'static,
    {
        self.subscribe_with_resync(topic, handler, || {}).await
    }

    /// Like [`subscribe`](Self::subscribe), resubscribing with backoff when
    /// the stream ends
    ///
    /// Messages published while the stream is down are lost, so `on_resync`
    /// runs when the stream ends and again once the subscription is live
    /// again. Callers drop whatever those messages could have invalidated.
    pub async fn subscribe_with_resync<H, R>(
        &self,
        topic: &str,
        handler: H,
        on_resync: R,
    ) -> Result<Subscription>
    where
        H: Fn(InvalidationMessage) + Send + Sync + 'static,
        R: Fn() + Send + Sync + 'static,
    {
        let mut stream = self.open_stream(topic).await?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let task_topic = topic.to_string();
        let bus = self.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!("Invalidation subscription {} cancelled", task_topic);
                        break;
                    }
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => match CacheKey::from_wire(&msg.payload) {
                                Some(key) => handler(InvalidationMessage { key }),
                                None => warn!(
                                    "Dropping non UTF-8 invalidation on topic {}",
                                    msg.topic
                                ),
                            },
                            None => {
                                warn!(
                                    "Invalidation stream for {} ended, resubscribing",
                                    task_topic
                                );
                                on_resync();
                                match bus.reopen_stream(&task_topic, &mut cancel_rx).await {
                                    Some(reopened) => {
                                        stream = reopened;
                                        on_resync();
                                        info!(
                                            "Resubscribed to invalidations on topic {}",
                                            task_topic
                                        );
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                }
            }
        });

        info!("Subscribed to invalidations on topic {}", topic);

        Ok(Subscription {
            topic: topic.to_string(),
            cancel_tx: Some(cancel_tx),
            task: Some(task),
        })
    }

    async fn open_stream(&self, topic: &str) -> Result<BusStream> {
        match tokio::time::timeout(self.timeout, self.transport.subscribe(topic)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(CacheError::unavailable(
                Level::Bus,
                format!("subscribe to {} failed: {}", topic, e),
            )),
            Err(_) => Err(CacheError::unavailable(
                Level::Bus,
                format!("subscribe to {} timed out after {:?}", topic, self.timeout),
            )),
        }
    }

    /// Retry `open_stream` with exponential backoff; `None` once cancelled
    async fn reopen_stream(
        &self,
        topic: &str,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> Option<BusStream> {
        let mut delay = self.reconnect_delay;
        loop {
            tokio::select! {
                _ = &mut *cancel_rx => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.open_stream(topic).await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    warn!(
                        "Resubscribe to {} failed, next attempt in {:?}: {}",
                        topic, delay, e
                    );
                    delay = (delay * 2).min(self.max_reconnect_delay);
                }
            }
        }
    }
}

/// Handle for a live invalidation subscription
///
/// Dropping the handle cancels the dispatch task.
pub struct Subscription {
    topic: String,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the dispatch task is still running
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop dispatching and wait for the task to finish
    pub async fn unsubscribe(mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Invalidation dispatch task for {} failed: {}", self.topic, e);
            }
        }
        info!("Unsubscribed from invalidations on topic {}", self.topic);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // send() fails if the task already stopped
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Topic pattern: `.`-separated segments, `*` matches one segment,
/// a trailing `#` matches zero or more
#[derive(Clone, Debug, PartialEq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Exact(String),
    One,
    Rest,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> std::result::Result<Self, TransportError> {
        if pattern.is_empty() {
            return Err(TransportError::InvalidTopic(
                "Topic cannot be empty".to_string(),
            ));
        }

        let segments: Vec<Segment> = pattern
            .split('.')
            .map(|seg| match seg {
                "*" => Segment::One,
                "#" => Segment::Rest,
                s => Segment::Exact(s.to_string()),
            })
            .collect();

        let rest_at = segments.iter().position(|s| *s == Segment::Rest);
        if rest_at.is_some_and(|i| i != segments.len() - 1) {
            return Err(TransportError::InvalidTopic(format!(
                "# wildcard must be the last segment: {}",
                pattern
            )));
        }

        Ok(Self { segments })
    }

    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();
        let mut idx = 0;

        for segment in &self.segments {
            match segment {
                Segment::Exact(s) => {
                    if parts.get(idx) != Some(&s.as_str()) {
                        return false;
                    }
                    idx += 1;
                }
                Segment::One => {
                    if idx >= parts.len() {
                        return false;
                    }
                    idx += 1;
                }
                Segment::Rest => return true,
            }
        }

        idx == parts.len()
    }
}

/// In-process broker
///
/// Clones share subscribers, so coordinators built over one `MemoryBus`
/// exchange invalidations like processes on one message bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscribers: Arc<RwLock<Vec<MemorySubscriber>>>,
}

struct MemorySubscriber {
    pattern: TopicPattern,
    sender: mpsc::UnboundedSender<BusMessage>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every subscriber, ending their streams as a broker restart would
    pub fn disconnect_all(&self) {
        self.subscribers.write().clear();
    }

    /// Live subscriptions
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers.len()
    }
}

#[async_trait]
impl BusTransport for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> std::result::Result<(), TransportError> {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|s| !s.sender.is_closed());

        let mut delivered = 0;
        for sub in subscribers.iter().filter(|s| s.pattern.matches(topic)) {
            let msg = BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if sub.sender.send(msg).is_ok() {
                delivered += 1;
            }
        }

        debug!("MemoryBus delivered on {} to {} subscribers", topic, delivered);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> std::result::Result<BusStream, TransportError> {
        let pattern = TopicPattern::parse(topic)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(MemorySubscriber {
            pattern,
            sender: tx,
        });
        Ok(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }
}

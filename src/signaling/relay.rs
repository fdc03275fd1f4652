//! Topic-scoped publish/subscribe relay consumed by the signaling channel.

use crate::errors::LinkError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One subscriber's view of a topic. Payloads from a single publisher arrive
/// in publish order.
#[derive(Debug)]
pub struct RelaySubscription {
    pub id: u64,
    pub topic: String,
    pub receiver: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, LinkError>;

    /// Best-effort, at-most-once delivery to every subscriber of `topic`,
    /// possibly including the publisher itself.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), LinkError>;

    /// Removing an unknown subscription is a no-op.
    async fn unsubscribe(&self, topic: &str, subscription_id: u64);
}

/// In-process broadcast relay. Echoes every payload back to its publisher,
/// like hosted realtime relays do.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<MemoryRelayInner>,
}

#[derive(Default)]
struct MemoryRelayInner {
    topics: Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Bytes>)>>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    published: AtomicU64,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a relay outage: subscribe and publish fail while offline.
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .map(|topics| topics.get(topic).map_or(0, |subs| subs.len()))
            .unwrap_or(0)
    }

    /// Total payloads accepted for delivery
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    fn ensure_online(&self, topic: &str) -> Result<(), LinkError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(LinkError::ChannelUnavailable(format!(
                "relay offline for topic {}",
                topic
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, LinkError> {
        self.ensure_online(topic)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut topics = self
            .inner
            .topics
            .lock()
            .map_err(|_| LinkError::ChannelUnavailable("relay lock poisoned".to_string()))?;
        topics.entry(topic.to_string()).or_default().push((id, tx));

        Ok(RelaySubscription {
            id,
            topic: topic.to_string(),
            receiver: rx,
        })
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), LinkError> {
        self.ensure_online(topic)?;

        let mut topics = self
            .inner
            .topics
            .lock()
            .map_err(|_| LinkError::ChannelUnavailable("relay lock poisoned".to_string()))?;
        if let Some(subscribers) = topics.get_mut(topic) {
            // Drop subscribers whose receiving side is gone.
            subscribers.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        }
        self.inner.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, subscription_id: u64) {
        if let Ok(mut topics) = self.inner.topics.lock() {
            if let Some(subscribers) = topics.get_mut(topic) {
                subscribers.retain(|(id, _)| *id != subscription_id);
                if subscribers.is_empty() {
                    topics.remove(topic);
                }
            }
        }
    }
}

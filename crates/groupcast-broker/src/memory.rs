//! In-memory broker for single-node deployments and tests.
//!
//! Each subscription owns its own unbounded channel, registered under the
//! topic. Publishing clones the payload into every channel open on the topic
//! at that instant.
//!
//! Fault injection: [`MemoryBroker::set_available`] makes publish and
//! subscribe fail with [`BrokerError::Unavailable`], and
//! [`MemoryBroker::sever`] drops every subscription on a topic as if the
//! broker connection was lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Broker, BrokerError, TopicSubscription};

type Subscribers = HashMap<u64, mpsc::UnboundedSender<Bytes>>;

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, Subscribers>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    published: AtomicU64,
}

impl Inner {
    fn remove(&self, topic: &str, id: u64) -> bool {
        let mut topics = self.topics.lock();
        let Some(subs) = topics.get_mut(topic) else {
            return false;
        };
        let removed = subs.remove(&id).is_some();
        if subs.is_empty() {
            let _ = topics.remove(topic);
        }
        removed
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(BrokerError::Unavailable("memory broker marked unavailable".into()))
        } else {
            Ok(())
        }
    }
}

/// In-process [`Broker`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability. While unavailable, publish and subscribe fail.
    /// Open subscriptions keep receiving.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::Release);
    }

    /// Drop every subscription on `topic`; their streams end with `None`.
    /// Returns how many were severed.
    pub fn sever(&self, topic: &str) -> usize {
        let severed = self.inner.topics.lock().remove(topic);
        let count = severed.map_or(0, |subs| subs.len());
        debug!(topic, count, "severed memory subscriptions");
        count
    }

    /// Open subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.lock().get(topic).map_or(0, HashMap::len)
    }

    /// Topics with at least one open subscription.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner.topics.lock().len()
    }

    /// Payloads accepted since creation.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.inner.check_available()?;
        let topics = self.inner.topics.lock();
        if let Some(subs) = topics.get(topic) {
            for tx in subs.values() {
                // a closed receiver is mid-unsubscribe and will be removed
                let _ = tx.send(payload.clone());
            }
        }
        let _ = self.inner.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn TopicSubscription>, BrokerError> {
        self.inner.check_available()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self
            .inner
            .topics
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .insert(id, tx);
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            topic: topic.to_owned(),
            id,
            rx,
        }))
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    topic: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl TopicSubscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BrokerError> {
        let _ = self.inner.remove(&self.topic, self.id);
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let _ = self.inner.remove(&self.topic, self.id);
    }
}

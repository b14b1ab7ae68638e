//! # groupcast-broker
//!
//! The external pub/sub collaborator behind group topics.
//!
//! - [`Broker`]: publish bytes to a topic, open a subscription to a topic
//! - [`TopicSubscription`]: one isolated subscription with its own stream
//! - [`MemoryBroker`]: in-process implementation with fault injection
//! - `RedisBroker` (feature `redis`): Redis pub/sub, one connection per topic
//!
//! Every subscription is independent. Closing or losing one topic's
//! subscription never touches another topic's transport.

#![deny(unsafe_code)]

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_pubsub;

use async_trait::async_trait;
use bytes::Bytes;
pub use groupcast_core::BrokerError;

pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use redis_pubsub::RedisBroker;

/// Publish/subscribe primitives a group bridge consumes.
///
/// Delivery is assumed at-least-once to every subscription that is open at
/// publish time.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;

    /// Publish `payload` on `topic`. Resolves once the broker accepted it.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Open a new subscription to `topic`. Resolves once the broker confirmed it.
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn TopicSubscription>, BrokerError>;
}

/// A single open subscription.
#[async_trait]
pub trait TopicSubscription: Send {
    /// Topic this subscription listens on.
    fn topic(&self) -> &str;

    /// Next payload, or `None` once the underlying connection is lost.
    ///
    /// Must be cancel-safe: dropping the future never loses a payload.
    async fn next(&mut self) -> Option<Bytes>;

    /// Close the subscription. Resolves once the broker confirmed it.
    async fn unsubscribe(self: Box<Self>) -> Result<(), BrokerError>;
}

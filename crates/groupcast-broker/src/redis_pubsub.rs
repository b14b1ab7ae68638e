//! Redis pub/sub broker.
//!
//! Publishing goes through one cached multiplexed connection, re-opened
//! after an I/O failure. Every subscription opens its own dedicated pub/sub
//! connection, so a reconnect or unsubscribe on one topic never disturbs
//! another topic's stream.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{Broker, BrokerError, TopicSubscription};

fn map_err(err: &redis::RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        BrokerError::Unavailable(err.to_string())
    } else {
        BrokerError::Rejected(err.to_string())
    }
}

/// [`Broker`] backed by Redis `PUBLISH` / `SUBSCRIBE`.
pub struct RedisBroker {
    client: redis::Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBroker {
    /// Validate `url` and prepare a client. No connection is opened yet.
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(|e| map_err(&e))?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
        })
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, BrokerError> {
        let mut slot = self.publisher.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_err(&e))?;
        debug!("opened redis publish connection");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_publisher(&self) {
        *self.publisher.lock().await = None;
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let mut conn = self.publisher().await?;
        let result: redis::RedisResult<i64> = conn.publish(topic, payload.as_ref()).await;
        match result {
            Ok(_receivers) => Ok(()),
            Err(e) => {
                let mapped = map_err(&e);
                if mapped.is_transient() {
                    warn!(topic, error = %e, "redis publish connection lost");
                    self.reset_publisher().await;
                }
                Err(mapped)
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn TopicSubscription>, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| map_err(&e))?;
        pubsub.subscribe(topic).await.map_err(|e| map_err(&e))?;
        debug!(topic, "opened redis subscription");
        Ok(Box::new(RedisSubscription {
            topic: topic.to_owned(),
            stream: Box::pin(pubsub.into_on_message()),
        }))
    }
}

struct RedisSubscription {
    topic: String,
    stream: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl TopicSubscription for RedisSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn next(&mut self) -> Option<Bytes> {
        let msg = self.stream.next().await?;
        Some(Bytes::copy_from_slice(msg.get_payload_bytes()))
    }

    /// The connection is dedicated to this topic, so closing it is the
    /// unsubscribe.
    async fn unsubscribe(self: Box<Self>) -> Result<(), BrokerError> {
        debug!(topic = %self.topic, "closing redis subscription");
        drop(self);
        Ok(())
    }
}

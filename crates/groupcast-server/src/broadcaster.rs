//! Group Broadcaster: sequences messages per (sender, group) and hands them
//! to the bridge.
//!
//! A sequence number is consumed only when the broker accepts the publish.
//! A `PublishFailed` leaves the counter untouched, so the caller's retry
//! reuses the same number and members never see a gap.

use std::collections::HashMap;
use std::sync::Arc;

use groupcast_core::protocol::validate_group_name;
use groupcast_core::{ConnectionId, Envelope, GroupError, Message, PresenceEvent};
use metrics::counter;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bridge::PubSubBridge;
use crate::metrics::{MESSAGES_PUBLISHED_TOTAL, PUBLISH_FAILURES_TOTAL};
use crate::registry::ConnectionRegistry;

/// Next sequence number per group, for one sender.
type SenderSequences = Arc<Mutex<HashMap<String, u64>>>;

/// Publishes sequenced messages and presence notices.
pub struct GroupBroadcaster {
    registry: Arc<ConnectionRegistry>,
    sequences: parking_lot::Mutex<HashMap<ConnectionId, SenderSequences>>,
}

impl GroupBroadcaster {
    /// Create a broadcaster publishing through `registry`'s bridge.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            sequences: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn bridge(&self) -> &PubSubBridge {
        self.registry.bridge()
    }

    fn sender_sequences(&self, sender: &ConnectionId) -> SenderSequences {
        Arc::clone(self.sequences.lock().entry(sender.clone()).or_default())
    }

    /// Publish `payload` to `group` as `sender`.
    ///
    /// Returns the message as accepted by the broker. The sender need not be
    /// a member of `group`, but must be registered.
    pub async fn publish(
        &self,
        group: &str,
        sender: &ConnectionId,
        payload: Value,
    ) -> Result<Message, GroupError> {
        validate_group_name(group)?;
        if !self.registry.contains(sender).await {
            return Err(GroupError::InvalidConnection(sender.clone()));
        }

        let slot = self.sender_sequences(sender);
        // held across the broker call so one sender's publishes to a group
        // are accepted in sequence order
        let mut next = slot.lock().await;
        let seq = next.get(group).copied().unwrap_or(0);
        let message = Message {
            group: group.to_owned(),
            sender: sender.clone(),
            seq,
            payload,
        };
        let envelope = Envelope::Message(message.clone());

        match self.bridge().publish(group, &envelope).await {
            Ok(()) => {
                let _ = next.insert(group.to_owned(), seq + 1);
                counter!(MESSAGES_PUBLISHED_TOTAL).increment(1);
                debug!(connection_id = %sender, group, seq, "message published");
                Ok(message)
            }
            Err(e) => {
                counter!(PUBLISH_FAILURES_TOTAL).increment(1);
                warn!(connection_id = %sender, group, seq, error = %e, "publish failed");
                Err(e)
            }
        }
    }

    /// Publish a presence notice for `connection` in `group`.
    pub async fn announce(
        &self,
        group: &str,
        connection: &ConnectionId,
        event: PresenceEvent,
    ) -> Result<(), GroupError> {
        let envelope = Envelope::Presence {
            group: group.to_owned(),
            connection: connection.clone(),
            event,
        };
        self.bridge().publish(group, &envelope).await
    }

    /// Sequence number the next accepted publish from `sender` to `group` gets.
    pub async fn next_seq(&self, sender: &ConnectionId, group: &str) -> u64 {
        let slot = self.sequences.lock().get(sender).cloned();
        match slot {
            Some(slot) => slot.lock().await.get(group).copied().unwrap_or(0),
            None => 0,
        }
    }

    /// Drop sequence state for a departed sender.
    pub fn forget_sender(&self, sender: &ConnectionId) {
        let _ = self.sequences.lock().remove(sender);
    }

    /// Senders with sequence state.
    pub fn tracked_senders(&self) -> usize {
        self.sequences.lock().len()
    }
}

//! Pub/Sub Bridge: maps groups to broker topics and fans broker traffic out
//! to local members.
//!
//! Each group owns an isolated broker subscription with an explicit
//! reference count and a [`SubscriptionState`] machine. All transitions run
//! under the group's lock:
//!
//! - first subscribe: `Absent → Subscribing → Active`, fully awaited (broker
//!   confirmation and receive-loop start) before the lock is released
//! - last unsubscribe: `Active → Unsubscribing → Absent`, stopping the
//!   receive loop and awaiting broker confirmation before the lock is released
//!
//! so a joiner can never attach to a subscription that is mid-teardown.
//!
//! The receive loop takes the same lock for every fan-out, so deliveries use
//! the exact membership current at that instant. If the broker stream ends
//! the loop marks the group `Resubscribing` under the lock, re-opens that
//! topic alone with backoff, then flips back to `Active` and tells members a
//! gap may exist, again under the lock. Joins are refused while a group is
//! `Resubscribing`, so no caller is confirmed onto a dead stream it has not
//! been told about.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use groupcast_broker::{Broker, TopicSubscription};
use groupcast_core::protocol::{topic_for, validate_group_name};
use groupcast_core::retry::RetryConfig;
use groupcast_core::{BrokerError, Envelope, GroupError, ServerEvent};
use metrics::{counter, gauge};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::group::{
    ActiveSubscription, GroupArena, GroupGuard, GroupState, SubscriptionState,
};
use crate::metrics::{
    BROKER_DECODE_ERRORS_TOTAL, BROKER_RESUBSCRIBES_TOTAL, BROKER_SUBSCRIPTIONS_ACTIVE,
    MESSAGES_DELIVERED_TOTAL,
};

/// Bridge behavior knobs.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Prepended to every group topic.
    pub topic_prefix: String,
    /// Deliver messages back to their sender.
    pub echo_to_sender: bool,
    /// Backoff for re-establishing a lost topic subscription.
    pub resubscribe: RetryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "groupcast:".into(),
            echo_to_sender: false,
            resubscribe: RetryConfig {
                max_retries: u32::MAX,
                base_delay_ms: 100,
                max_delay_ms: 5_000,
                jitter_factor: 0.2,
            },
        }
    }
}

/// Owns group subscriptions and the broker handle.
pub struct PubSubBridge {
    broker: Arc<dyn Broker>,
    arena: GroupArena,
    config: BridgeConfig,
    active: Arc<AtomicUsize>,
}

impl PubSubBridge {
    /// Create a bridge over `broker`.
    pub fn new(broker: Arc<dyn Broker>, config: BridgeConfig) -> Self {
        Self {
            broker,
            arena: GroupArena::new(),
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Group records.
    pub fn arena(&self) -> &GroupArena {
        &self.arena
    }

    /// Bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Backend name of the broker.
    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }

    /// Broker topic for `group`.
    pub fn topic(&self, group: &str) -> String {
        topic_for(&self.config.topic_prefix, group)
    }

    /// Groups whose receive loop is on a live broker stream.
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Reference count for `group` (0 if unknown).
    pub async fn refcount(&self, group: &str) -> usize {
        match self.arena.lock_existing(group).await {
            Some(guard) => guard.refcount,
            None => 0,
        }
    }

    /// Whether `group` has a receive loop on a live broker stream.
    pub async fn is_subscribed(&self, group: &str) -> bool {
        match self.arena.lock_existing(group).await {
            Some(guard) => guard.subscription.is_active(),
            None => false,
        }
    }

    /// Take one reference on `group`'s subscription, opening it on the first.
    ///
    /// Runs to completion on its own task even if the caller is dropped.
    pub async fn subscribe(self: &Arc<Self>, group: &str) -> Result<(), GroupError> {
        validate_group_name(group)?;
        let this = Arc::clone(self);
        let group = group.to_owned();
        tokio::spawn(async move {
            let mut guard = this.lock_group(&group).await;
            let result = this.subscribe_locked(&mut guard).await;
            let _ = this.arena.collect(&mut guard);
            result
        })
        .await
        .map_err(|e| GroupError::Internal(format!("subscribe task failed: {e}")))?
    }

    /// Drop one reference on `group`'s subscription, closing it on the last.
    ///
    /// A no-op when the count is already zero.
    pub async fn unsubscribe(self: &Arc<Self>, group: &str) -> Result<(), GroupError> {
        let this = Arc::clone(self);
        let group = group.to_owned();
        tokio::spawn(async move {
            let Some(mut guard) = this.arena.lock_existing(&group).await else {
                return Ok(());
            };
            let result = this.unsubscribe_locked(&mut guard).await;
            let _ = this.arena.collect(&mut guard);
            result
        })
        .await
        .map_err(|e| GroupError::Internal(format!("unsubscribe task failed: {e}")))?
    }

    /// Publish `envelope` on its group's topic.
    ///
    /// Resolves when the broker accepted it; does not wait for, or lock
    /// anything for, local delivery.
    pub async fn publish(&self, group: &str, envelope: &Envelope) -> Result<(), GroupError> {
        let failed = |source| GroupError::PublishFailed {
            group: group.to_owned(),
            source,
        };
        let payload = envelope.encode().map_err(failed)?;
        let topic = self.topic(group);
        self.broker
            .publish(&topic, Bytes::from(payload))
            .await
            .map_err(failed)
    }

    pub(crate) async fn lock_group(&self, group: &str) -> GroupGuard {
        self.arena.lock(group, || self.topic(group)).await
    }

    /// Subscribe while holding the group lock.
    #[instrument(skip_all, fields(group = %guard.name))]
    pub(crate) async fn subscribe_locked(&self, guard: &mut GroupGuard) -> Result<(), GroupError> {
        if guard.refcount > 0 {
            if matches!(guard.subscription, SubscriptionState::Resubscribing(_)) {
                debug!(topic = %guard.topic, "refusing subscribe while topic is re-opened");
                return Err(GroupError::SubscriptionFailed {
                    group: guard.name.clone(),
                    source: BrokerError::Closed,
                });
            }
            guard.refcount += 1;
            return Ok(());
        }

        guard.subscription = SubscriptionState::Subscribing;
        let sub = match self.broker.subscribe(&guard.topic).await {
            Ok(sub) => sub,
            Err(source) => {
                guard.subscription = SubscriptionState::Absent;
                warn!(topic = %guard.topic, error = %source, "broker subscribe failed");
                return Err(GroupError::SubscriptionFailed {
                    group: guard.name.clone(),
                    source,
                });
            }
        };

        let cancel = CancellationToken::new();
        let receive = ReceiveLoop {
            slot: Arc::clone(OwnedMutexGuard::mutex(guard)),
            broker: Arc::clone(&self.broker),
            group: guard.name.clone(),
            topic: guard.topic.clone(),
            echo_to_sender: self.config.echo_to_sender,
            resubscribe: self.config.resubscribe.clone(),
            cancel: cancel.clone(),
            active: Arc::clone(&self.active),
        };
        let task = tokio::spawn(receive.run(sub));

        guard.subscription = SubscriptionState::Active(ActiveSubscription { cancel, task });
        guard.refcount = 1;
        let _ = self.active.fetch_add(1, Ordering::AcqRel);
        gauge!(BROKER_SUBSCRIPTIONS_ACTIVE).increment(1.0);
        debug!(topic = %guard.topic, "group subscription active");
        Ok(())
    }

    /// Unsubscribe while holding the group lock.
    #[instrument(skip_all, fields(group = %guard.name))]
    pub(crate) async fn unsubscribe_locked(
        &self,
        guard: &mut GroupGuard,
    ) -> Result<(), GroupError> {
        if guard.refcount == 0 {
            return Ok(());
        }
        guard.refcount -= 1;
        if guard.refcount > 0 {
            return Ok(());
        }

        let previous = std::mem::replace(&mut guard.subscription, SubscriptionState::Unsubscribing);
        let was_live = previous.is_active();
        let result = match previous {
            SubscriptionState::Active(active) | SubscriptionState::Resubscribing(active) => {
                active.cancel.cancel();
                let sub = match active.task.await {
                    Ok(sub) => sub,
                    Err(e) => {
                        warn!(error = %e, "receive loop ended abnormally");
                        None
                    }
                };
                if was_live {
                    let _ = self.active.fetch_sub(1, Ordering::AcqRel);
                    gauge!(BROKER_SUBSCRIPTIONS_ACTIVE).decrement(1.0);
                }
                match sub {
                    Some(sub) => sub.unsubscribe().await.map_err(|source| {
                        warn!(topic = %guard.topic, error = %source, "broker unsubscribe failed");
                        GroupError::SubscriptionFailed {
                            group: guard.name.clone(),
                            source,
                        }
                    }),
                    None => Ok(()),
                }
            }
            SubscriptionState::Absent
            | SubscriptionState::Subscribing
            | SubscriptionState::Unsubscribing => Ok(()),
        };
        guard.subscription = SubscriptionState::Absent;
        debug!(topic = %guard.topic, "group subscription closed");
        result
    }
}

/// One topic's dedicated receive path.
struct ReceiveLoop {
    slot: Arc<Mutex<GroupState>>,
    broker: Arc<dyn Broker>,
    group: String,
    topic: String,
    echo_to_sender: bool,
    resubscribe: RetryConfig,
    cancel: CancellationToken,
    /// Bridge-wide count of `Active` groups.
    active: Arc<AtomicUsize>,
}

impl ReceiveLoop {
    /// Runs until cancelled; hands the live subscription back for teardown.
    async fn run(self, mut sub: Box<dyn TopicSubscription>) -> Option<Box<dyn TopicSubscription>> {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Some(sub),
                next = sub.next() => next,
            };

            let Some(payload) = next else {
                warn!(topic = %self.topic, "broker subscription lost, resubscribing");
                drop(sub);
                {
                    let mut state = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return None,
                        state = self.slot.lock() => state,
                    };
                    if state.subscription.degrade() {
                        self.set_live(false);
                    }
                }
                sub = self.resubscribe().await?;
                counter!(BROKER_RESUBSCRIBES_TOTAL).increment(1);
                info!(topic = %self.topic, "broker subscription re-established");
                let event = ServerEvent::GroupResubscribed {
                    group: self.group.clone(),
                };
                let frame = serde_json::to_string(&event).ok().map(Arc::new);
                let mut state = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Some(sub),
                    state = self.slot.lock() => state,
                };
                if state.subscription.restore() {
                    self.set_live(true);
                }
                if let Some(frame) = frame {
                    for conn in state.members.values() {
                        let _ = conn.deliver(Arc::clone(&frame));
                    }
                }
                continue;
            };

            let envelope = match Envelope::decode(&payload) {
                Ok(envelope) if envelope.group() == self.group => envelope,
                Ok(envelope) => {
                    counter!(BROKER_DECODE_ERRORS_TOTAL).increment(1);
                    warn!(topic = %self.topic, got = envelope.group(), "envelope for another group on topic");
                    continue;
                }
                Err(e) => {
                    counter!(BROKER_DECODE_ERRORS_TOTAL).increment(1);
                    warn!(topic = %self.topic, error = %e, "undecodable broker payload");
                    continue;
                }
            };
            let frame = match client_frame(&envelope) {
                Ok(frame) => Arc::new(frame),
                Err(e) => {
                    counter!(BROKER_DECODE_ERRORS_TOTAL).increment(1);
                    warn!(topic = %self.topic, error = %e, "failed to encode client frame");
                    continue;
                }
            };

            let state = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Some(sub),
                state = self.slot.lock() => state,
            };
            let delivered = fan_out(&state, &envelope, &frame, self.echo_to_sender);
            counter!(MESSAGES_DELIVERED_TOTAL).increment(delivered);
        }
    }

    fn set_live(&self, live: bool) {
        if live {
            let _ = self.active.fetch_add(1, Ordering::AcqRel);
            gauge!(BROKER_SUBSCRIPTIONS_ACTIVE).increment(1.0);
        } else {
            let _ = self.active.fetch_sub(1, Ordering::AcqRel);
            gauge!(BROKER_SUBSCRIPTIONS_ACTIVE).decrement(1.0);
        }
    }

    /// Re-open the topic with backoff until it succeeds or the loop is cancelled.
    async fn resubscribe(&self) -> Option<Box<dyn TopicSubscription>> {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.resubscribe.delay_for(attempt, rand::random());
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                result = self.broker.subscribe(&self.topic) => result,
            };
            match result {
                Ok(sub) => return Some(sub),
                Err(e) => {
                    warn!(topic = %self.topic, attempt, error = %e, "resubscribe failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

/// JSON text frame a member receives for `envelope`.
fn client_frame(envelope: &Envelope) -> serde_json::Result<String> {
    match envelope {
        Envelope::Message(message) => serde_json::to_string(message),
        Envelope::Presence {
            group,
            connection,
            event,
        } => serde_json::to_string(&ServerEvent::presence(
            group.clone(),
            connection.clone(),
            *event,
        )),
    }
}

/// Deliver `frame` to the current members. Presence never reaches its
/// subject; messages reach their sender only with echo enabled.
fn fan_out(state: &GroupState, envelope: &Envelope, frame: &Arc<String>, echo: bool) -> u64 {
    let origin = envelope.origin();
    let skip_origin = match envelope {
        Envelope::Message(_) => !echo,
        Envelope::Presence { .. } => true,
    };
    let mut delivered = 0;
    for (id, conn) in &state.members {
        if skip_origin && id == origin {
            continue;
        }
        if conn.deliver(Arc::clone(frame)).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

//! Arena of group records indexed by name.
//!
//! Each group lives behind its own async mutex. Every membership change,
//! subscription transition and delivery snapshot for a group happens while
//! holding that lock, and nothing else does: operations on different groups
//! never contend.
//!
//! A group is created on first [`GroupArena::lock`] and collected (removed
//! from the map) only while its lock is held and it is fully idle. A caller
//! that raced the collection and then acquires a retired record simply
//! retries against the fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use groupcast_core::ConnectionId;
use groupcast_broker::TopicSubscription;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::websocket::connection::ClientConnection;

/// Broker subscription state of one group.
pub(crate) enum SubscriptionState {
    /// No broker subscription.
    Absent,
    /// Broker subscribe in flight.
    Subscribing,
    /// Receive loop running on a live broker stream.
    Active(ActiveSubscription),
    /// Broker stream lost; the receive loop is re-opening the topic.
    Resubscribing(ActiveSubscription),
    /// Receive loop being stopped and broker unsubscribe in flight.
    Unsubscribing,
}

impl SubscriptionState {
    pub(crate) fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// `Active → Resubscribing`. Returns whether the transition happened.
    pub(crate) fn degrade(&mut self) -> bool {
        match std::mem::replace(self, Self::Absent) {
            Self::Active(sub) => {
                *self = Self::Resubscribing(sub);
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }

    /// `Resubscribing → Active`. Returns whether the transition happened.
    pub(crate) fn restore(&mut self) -> bool {
        match std::mem::replace(self, Self::Absent) {
            Self::Resubscribing(sub) => {
                *self = Self::Active(sub);
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }
}

/// Handle to a running receive loop.
pub(crate) struct ActiveSubscription {
    /// Stops the receive loop.
    pub(crate) cancel: CancellationToken,
    /// Yields the subscription back when the loop stops.
    pub(crate) task: JoinHandle<Option<Box<dyn TopicSubscription>>>,
}

/// One group record.
pub(crate) struct GroupState {
    pub(crate) name: String,
    pub(crate) topic: String,
    pub(crate) members: HashMap<ConnectionId, Arc<ClientConnection>>,
    /// Outstanding bridge subscribe calls.
    pub(crate) refcount: usize,
    pub(crate) subscription: SubscriptionState,
    /// Set when collected; a guard on a retired record must be re-acquired.
    retired: bool,
}

impl GroupState {
    fn new(name: &str, topic: String) -> Self {
        Self {
            name: name.to_owned(),
            topic,
            members: HashMap::new(),
            refcount: 0,
            subscription: SubscriptionState::Absent,
            retired: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.members.is_empty() && self.refcount == 0 && self.subscription.is_absent()
    }
}

type Slot = Arc<Mutex<GroupState>>;

/// Locked group record.
pub(crate) type GroupGuard = OwnedMutexGuard<GroupState>;

/// All group records known to this process.
#[derive(Default)]
pub struct GroupArena {
    groups: parking_lot::Mutex<HashMap<String, Slot>>,
}

impl GroupArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Lock the record for `name`, creating it if needed.
    pub(crate) async fn lock(&self, name: &str, topic: impl Fn() -> String) -> GroupGuard {
        loop {
            let slot = {
                let mut groups = self.groups.lock();
                Arc::clone(
                    groups
                        .entry(name.to_owned())
                        .or_insert_with(|| Arc::new(Mutex::new(GroupState::new(name, topic())))),
                )
            };
            let guard = slot.lock_owned().await;
            if !guard.retired {
                return guard;
            }
        }
    }

    /// Lock the record for `name` if it exists.
    pub(crate) async fn lock_existing(&self, name: &str) -> Option<GroupGuard> {
        loop {
            let slot = self.groups.lock().get(name).cloned()?;
            let guard = slot.lock_owned().await;
            if !guard.retired {
                return Some(guard);
            }
        }
    }

    /// Remove the locked record from the arena if it is idle.
    ///
    /// Returns whether it was collected.
    pub(crate) fn collect(&self, guard: &mut GroupGuard) -> bool {
        if guard.retired || !guard.is_idle() {
            return false;
        }
        guard.retired = true;
        let slot = OwnedMutexGuard::mutex(guard);
        let mut groups = self.groups.lock();
        if groups.get(&guard.name).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            let _ = groups.remove(&guard.name);
        }
        true
    }

    /// Number of group records.
    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    /// Whether no group records exist.
    pub fn is_empty(&self) -> bool {
        self.groups.lock().is_empty()
    }

    /// Whether a record exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.groups.lock().contains_key(name)
    }

    /// Names of all group records.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

//! Per-sender sequence gap detection.
//!
//! Sequence numbers are scoped to a (group, sender) pair. A receiver that
//! joins mid-stream starts tracking at whatever number it sees first, so
//! only gaps after the first observation are reported.

use std::collections::HashMap;

use crate::ids::ConnectionId;
use crate::protocol::Message;

/// Result of observing one sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqObservation {
    /// First message seen from this sender in this group.
    First,
    /// Exactly the next expected number.
    InOrder,
    /// Numbers between `expected` and `got` were skipped.
    Gap {
        /// Number that should have arrived.
        expected: u64,
        /// Number that arrived instead.
        got: u64,
    },
    /// A number at or below the last one seen arrived again.
    Duplicate {
        /// Highest number seen so far.
        last: u64,
        /// Number that arrived.
        got: u64,
    },
}

impl SeqObservation {
    /// Whether this observation indicates lost or repeated delivery.
    #[must_use]
    pub fn is_anomaly(self) -> bool {
        matches!(self, Self::Gap { .. } | Self::Duplicate { .. })
    }
}

/// Tracks the last sequence number per (group, sender).
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: HashMap<(String, ConnectionId), u64>,
    gaps: u64,
    duplicates: u64,
}

impl SequenceTracker {
    /// Empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq` from `sender` in `group`.
    pub fn observe(&mut self, group: &str, sender: &ConnectionId, seq: u64) -> SeqObservation {
        let key = (group.to_owned(), sender.clone());
        let Some(last) = self.last.get_mut(&key) else {
            let _ = self.last.insert(key, seq);
            return SeqObservation::First;
        };
        let expected = last.saturating_add(1);
        if seq == expected {
            *last = seq;
            SeqObservation::InOrder
        } else if seq > expected {
            *last = seq;
            self.gaps += 1;
            SeqObservation::Gap { expected, got: seq }
        } else {
            self.duplicates += 1;
            SeqObservation::Duplicate {
                last: *last,
                got: seq,
            }
        }
    }

    /// Record a delivered message.
    pub fn observe_message(&mut self, message: &Message) -> SeqObservation {
        self.observe(&message.group, &message.sender, message.seq)
    }

    /// Stop tracking a sender in a group (e.g. after it left).
    pub fn forget(&mut self, group: &str, sender: &ConnectionId) {
        let _ = self.last.remove(&(group.to_owned(), sender.clone()));
    }

    /// Stop tracking every sender in a group (e.g. after a resubscribe).
    pub fn forget_group(&mut self, group: &str) {
        self.last.retain(|(g, _), _| g != group);
    }

    /// Last number seen from `sender` in `group`.
    #[must_use]
    pub fn last_seen(&self, group: &str, sender: &ConnectionId) -> Option<u64> {
        self.last.get(&(group.to_owned(), sender.clone())).copied()
    }

    /// Total gaps observed.
    #[must_use]
    pub fn gap_count(&self) -> u64 {
        self.gaps
    }

    /// Total duplicates observed.
    #[must_use]
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates
    }
}

//! Error taxonomy for group broadcast.
//!
//! - [`BrokerError`]: what the pub/sub collaborator reports
//! - [`GroupError`]: what membership and publish operations surface to callers
//!
//! Every [`GroupError`] maps to a stable wire [`code`](GroupError::code) that
//! is sent to clients in `error` frames.

use thiserror::Error;

use crate::ids::ConnectionId;

/// Failure reported by a broker implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker connection is down or could not be established.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Broker refused the operation.
    #[error("broker rejected operation: {0}")]
    Rejected(String),

    /// The topic subscription was lost and is not re-established yet.
    #[error("subscription closed")]
    Closed,

    /// Payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl BrokerError {
    /// Whether the same call may succeed once the broker connection is back.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Closed)
    }
}

/// Errors surfaced by the registry, bridge and broadcaster.
#[derive(Debug, Error)]
pub enum GroupError {
    /// Referenced connection is not registered.
    #[error("unknown connection: {0}")]
    InvalidConnection(ConnectionId),

    /// Group name failed validation.
    #[error("invalid group name {name:?}: {reason}")]
    InvalidGroup {
        /// Offending name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Broker subscribe or unsubscribe failed; membership was not committed.
    #[error("subscription to group {group} failed: {source}")]
    SubscriptionFailed {
        /// Group being subscribed.
        group: String,
        /// Underlying broker failure.
        #[source]
        source: BrokerError,
    },

    /// Broker rejected a publish; safe to retry with the same sequence number.
    #[error("publish to group {group} failed: {source}")]
    PublishFailed {
        /// Target group.
        group: String,
        /// Underlying broker failure.
        #[source]
        source: BrokerError,
    },

    /// Outbound queue of a connection is full; the connection is closed.
    #[error("outbound queue overflow on connection {0}")]
    Overflow(ConnectionId),

    /// A membership critical section did not run to completion.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GroupError {
    /// Stable machine-readable code sent to clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConnection(_) => "INVALID_CONNECTION",
            Self::InvalidGroup { .. } => "INVALID_GROUP",
            Self::SubscriptionFailed { .. } => "SUBSCRIPTION_FAILED",
            Self::PublishFailed { .. } => "PUBLISH_FAILED",
            Self::Overflow(_) => "OVERFLOW",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PublishFailed { .. })
    }

    /// Group the error refers to, if any.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::InvalidGroup { name, .. } => Some(name),
            Self::SubscriptionFailed { group, .. } | Self::PublishFailed { group, .. } => {
                Some(group)
            }
            Self::InvalidConnection(_) | Self::Overflow(_) | Self::Internal(_) => None,
        }
    }
}

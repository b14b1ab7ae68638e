//! # groupcast-core
//!
//! Foundation types shared by every groupcast crate:
//!
//! - **Branded IDs**: [`ConnectionId`] as a newtype for type safety
//! - **Wire protocol**: client commands, deliveries, server events, broker envelopes
//! - **Errors**: [`GroupError`] taxonomy and [`BrokerError`] via `thiserror`
//! - **Retry**: backoff math shared by publish retries and broker resubscription
//! - **Sequence tracking**: per-sender gap detection used by clients and tests
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod sequence;

pub use errors::{BrokerError, GroupError};
pub use ids::ConnectionId;
pub use protocol::{
    ClientCommand, CommandKind, Envelope, InboundFrame, Message, PresenceEvent, ServerEvent,
};
pub use sequence::{SeqObservation, SequenceTracker};

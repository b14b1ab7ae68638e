//! # groupcast-server
//!
//! Group broadcast core and the Axum `WebSocket` gateway in front of it.
//!
//! - [`group`]: arena of per-group records, each behind its own lock
//! - [`bridge`]: group ↔ broker topic mapping, one isolated subscription per group
//! - [`registry`]: live connections and join/leave
//! - [`broadcaster`]: per-(sender, group) sequencing and publish
//! - [`websocket`]: connection state, heartbeat, command dispatch, session lifecycle
//! - HTTP endpoints: health check, Prometheus metrics, `WebSocket` upgrades
//! - Graceful shutdown via `CancellationToken` and a session `TaskTracker`

#![deny(unsafe_code)]

pub mod bridge;
pub mod broadcaster;
pub mod config;
pub mod context;
pub mod group;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use bridge::{BridgeConfig, PubSubBridge};
pub use broadcaster::GroupBroadcaster;
pub use config::{ServerConfig, SessionConfig};
pub use context::GatewayContext;
pub use registry::ConnectionRegistry;
pub use server::GroupcastServer;
pub use websocket::connection::{ClientConnection, CloseReason, ConnectionState};

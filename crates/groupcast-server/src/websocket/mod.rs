//! WebSocket connection state, heartbeat, command dispatch and session lifecycle.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod session;

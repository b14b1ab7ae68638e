//! `/health` body.

use std::time::Duration;

use serde::Serialize;

/// Coarse server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Accepting connections.
    Ok,
    /// Shutdown has begun; upgrades are refused.
    ShuttingDown,
}

/// Snapshot served at `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Server state.
    pub status: Status,
    /// Whole seconds since startup.
    pub uptime_secs: u64,
    /// Registered connections.
    pub connections: usize,
    /// Group records alive.
    pub groups: usize,
    /// Groups with an open broker subscription.
    pub active_subscriptions: usize,
}

impl HealthReport {
    /// Report for a server up for `uptime` with no connections or groups.
    pub fn new(uptime: Duration, shutting_down: bool) -> Self {
        Self {
            status: if shutting_down {
                Status::ShuttingDown
            } else {
                Status::Ok
            },
            uptime_secs: uptime.as_secs(),
            connections: 0,
            groups: 0,
            active_subscriptions: 0,
        }
    }
}

//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so partial
//! JSON is accepted and missing fields keep their default value.

use std::fmt;
use std::str::FromStr;

use groupcast_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "broker": { "kind": "redis", "url": "redis://cache:6379" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupcastSettings {
    /// Network listener and connection limits.
    pub server: ServerSettings,
    /// Per-connection session behavior.
    pub session: SessionSettings,
    /// Pub/sub broker selection.
    pub broker: BrokerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl GroupcastSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        let checks = [
            (
                self.session.outbound_capacity == 0,
                "session.outboundCapacity",
                "must be greater than 0",
            ),
            (
                server.max_connections == 0,
                "server.maxConnections",
                "must be greater than 0",
            ),
            (
                server.heartbeat_interval_ms == 0,
                "server.heartbeatIntervalMs",
                "must be greater than 0",
            ),
            (
                server.heartbeat_timeout_ms < server.heartbeat_interval_ms,
                "server.heartbeatTimeoutMs",
                "must be at least heartbeatIntervalMs",
            ),
            (
                self.broker.resubscribe_max_delay_ms < self.broker.resubscribe_base_delay_ms,
                "broker.resubscribeMaxDelayMs",
                "must be at least resubscribeBaseDelayMs",
            ),
        ];
        match checks.into_iter().find(|(failed, _, _)| *failed) {
            Some((_, field, reason)) => Err(SettingsError::invalid(field, reason)),
            None => Ok(()),
        }
    }
}

/// Server network settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Upgrades beyond this many live connections get HTTP 503.
    pub max_connections: usize,
    /// WebSocket ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a connection silent for this long, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// How long graceful shutdown waits for sessions, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_connections: 1024,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_message_size: 1024 * 1024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// Per-connection session behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Bounded outbound queue size per connection.
    pub outbound_capacity: usize,
    /// Deliver a connection's own messages back to it.
    pub echo_to_sender: bool,
    /// Publish `member.joined` / `member.left` notices.
    pub announce_presence: bool,
    /// Retries for a rejected publish before reporting failure.
    pub publish_retries: u32,
    /// Base backoff between publish retries in milliseconds.
    pub publish_retry_base_delay_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            echo_to_sender: false,
            announce_presence: true,
            publish_retries: 2,
            publish_retry_base_delay_ms: 50,
        }
    }
}

/// Which broker backs group topics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process broker; single-node only.
    #[default]
    Memory,
    /// Redis pub/sub.
    Redis,
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown broker kind: {other}")),
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

/// Pub/sub broker settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Broker implementation.
    pub kind: BrokerKind,
    /// Connection URL (Redis only).
    pub url: String,
    /// Prepended to every group topic.
    pub topic_prefix: String,
    /// First backoff step when a topic subscription is lost.
    pub resubscribe_base_delay_ms: u64,
    /// Backoff cap for topic resubscription.
    pub resubscribe_max_delay_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
            topic_prefix: "groupcast:".to_string(),
            resubscribe_base_delay_ms: 100,
            resubscribe_max_delay_ms: 5_000,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Filter directive, e.g. `info` or `groupcast_server=debug`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

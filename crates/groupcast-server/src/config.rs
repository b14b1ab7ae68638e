//! Server configuration.

use std::time::Duration;

use groupcast_core::retry::RetryConfig;
use groupcast_settings::GroupcastSettings;

use crate::bridge::BridgeConfig;

/// Configuration for the groupcast server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Close a client silent for this long.
    pub heartbeat_timeout: Duration,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// How long shutdown waits for sessions to finish closing.
    pub shutdown_timeout: Duration,
    /// Per-session behavior.
    pub session: SessionConfig,
    /// Group-to-topic bridge behavior.
    pub bridge: BridgeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_message_size: 1024 * 1024,
            shutdown_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &GroupcastSettings) -> Self {
        let server = &settings.server;
        let session = &settings.session;
        let broker = &settings.broker;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            heartbeat_interval: Duration::from_millis(server.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(server.heartbeat_timeout_ms),
            max_message_size: server.max_message_size,
            shutdown_timeout: Duration::from_millis(server.shutdown_timeout_ms),
            session: SessionConfig {
                outbound_capacity: session.outbound_capacity,
                announce_presence: session.announce_presence,
                publish_retry: RetryConfig {
                    max_retries: session.publish_retries,
                    base_delay_ms: session.publish_retry_base_delay_ms,
                    max_delay_ms: session.publish_retry_base_delay_ms.saturating_mul(16),
                    jitter_factor: 0.2,
                },
            },
            bridge: BridgeConfig {
                topic_prefix: broker.topic_prefix.clone(),
                echo_to_sender: session.echo_to_sender,
                resubscribe: RetryConfig {
                    max_retries: u32::MAX,
                    base_delay_ms: broker.resubscribe_base_delay_ms,
                    max_delay_ms: broker.resubscribe_max_delay_ms,
                    jitter_factor: 0.2,
                },
            },
        }
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-session behavior.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Outbound queue capacity; a full queue closes the connection.
    pub outbound_capacity: usize,
    /// Publish join/leave presence notices.
    pub announce_presence: bool,
    /// Retries for a `send` the broker rejected.
    pub publish_retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            announce_presence: true,
            publish_retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 50,
                max_delay_ms: 800,
                jitter_factor: 0.2,
            },
        }
    }
}

//! Metric names and the Prometheus recorder.
//!
//! Every counter, gauge and histogram the server emits is named here.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the process-global Prometheus recorder.
///
/// Only one recorder can be installed per process; a second call fails.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("metrics recorder ready, serving /metrics");
    Ok(handle)
}

/// Upgrades completed (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Sessions ended (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Sessions currently running (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Upgrades refused at the connection limit or during shutdown (counter).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Session lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Group joins total (counter).
pub const GROUP_JOINS_TOTAL: &str = "group_joins_total";
/// Group leaves total (counter).
pub const GROUP_LEAVES_TOTAL: &str = "group_leaves_total";
/// Commands handled total (counter, labels: command).
pub const COMMANDS_TOTAL: &str = "commands_total";
/// Command errors total (counter, labels: command, code).
pub const COMMAND_ERRORS_TOTAL: &str = "command_errors_total";
/// Messages accepted by the broker total (counter).
pub const MESSAGES_PUBLISHED_TOTAL: &str = "messages_published_total";
/// Broker publish failures total, including retried attempts (counter).
pub const PUBLISH_FAILURES_TOTAL: &str = "publish_failures_total";
/// Frames enqueued to members by fan-out (counter).
pub const MESSAGES_DELIVERED_TOTAL: &str = "messages_delivered_total";
/// Connections closed for a full outbound queue (counter).
pub const OUTBOUND_OVERFLOWS_TOTAL: &str = "outbound_overflows_total";
/// Groups with an open broker subscription (gauge).
pub const BROKER_SUBSCRIPTIONS_ACTIVE: &str = "broker_subscriptions_active";
/// Topic subscriptions re-established after a loss (counter).
pub const BROKER_RESUBSCRIBES_TOTAL: &str = "broker_resubscribes_total";
/// Broker payloads that could not be decoded (counter).
pub const BROKER_DECODE_ERRORS_TOTAL: &str = "broker_decode_errors_total";

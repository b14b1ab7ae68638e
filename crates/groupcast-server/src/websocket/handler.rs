//! WebSocket command dispatch: parses incoming text as a [`ClientCommand`]
//! and routes it to the registry or broadcaster.

use groupcast_core::{
    ClientCommand, CommandKind, ConnectionId, GroupError, Message, PresenceEvent, ServerEvent,
};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::connection::ClientConnection;
use crate::context::GatewayContext;
use crate::metrics::{COMMANDS_TOTAL, COMMAND_ERRORS_TOTAL};

/// Handle an incoming text frame and return the reply for the client.
///
/// On a room endpoint (`room` is set) a frame that is not a command record
/// is published to the room as the payload of an implicit `send`: parsed as
/// JSON when possible, otherwise as a string.
#[instrument(skip_all, fields(connection_id = %conn.id, command))]
pub async fn handle_message(
    message: &str,
    conn: &ClientConnection,
    ctx: &GatewayContext,
    room: Option<&str>,
) -> ServerEvent {
    let command = match serde_json::from_str::<ClientCommand>(message) {
        Ok(command) => command,
        Err(e) => match room {
            Some(room) => ClientCommand::Send {
                group: room.to_owned(),
                payload: serde_json::from_str(message)
                    .unwrap_or_else(|_| Value::String(message.to_owned())),
            },
            None => {
                warn!(error = %e, "invalid command received");
                counter!(COMMAND_ERRORS_TOTAL, "command" => "unknown", "code" => groupcast_core::protocol::INVALID_COMMAND)
                    .increment(1);
                return ServerEvent::invalid_command(format!("invalid command: {e}"));
            }
        },
    };

    let kind = command.kind();
    let _ = tracing::Span::current().record("command", kind.as_str());
    counter!(COMMANDS_TOTAL, "command" => kind.as_str()).increment(1);
    debug!(group = command.group(), "dispatching command");

    let reply = dispatch(command, conn, ctx).await;
    if let ServerEvent::Error { code, .. } = &reply {
        counter!(COMMAND_ERRORS_TOTAL, "command" => kind.as_str(), "code" => code.clone())
            .increment(1);
    }
    reply
}

/// Execute a parsed command and build the reply.
pub async fn dispatch(
    command: ClientCommand,
    conn: &ClientConnection,
    ctx: &GatewayContext,
) -> ServerEvent {
    let kind = command.kind();
    let result = match command {
        ClientCommand::Join { group } => join_group(conn, ctx, &group)
            .await
            .map(|_| ack(kind, group, None)),
        ClientCommand::Leave { group } => leave_group(&conn.id, ctx, &group)
            .await
            .map(|_| ack(kind, group, None)),
        ClientCommand::Send { group, payload } => publish_with_retry(ctx, &group, &conn.id, payload)
            .await
            .map(|message| ack(kind, group, Some(message.seq))),
    };
    result.unwrap_or_else(|e| ServerEvent::from_error(Some(kind), &e))
}

fn ack(command: CommandKind, group: String, seq: Option<u64>) -> ServerEvent {
    ServerEvent::Ack {
        command,
        group,
        seq,
    }
}

/// Join `group` and announce it to the other members.
///
/// Returns whether the connection was newly added.
pub async fn join_group(
    conn: &ClientConnection,
    ctx: &GatewayContext,
    group: &str,
) -> Result<bool, GroupError> {
    let joined = ctx.registry.join(&conn.id, group).await?;
    if joined && ctx.session.announce_presence {
        announce(ctx, group, &conn.id, PresenceEvent::Joined).await;
    }
    Ok(joined)
}

/// Leave `group` and announce it to the remaining members.
///
/// Returns whether the connection was a member.
pub async fn leave_group(
    id: &ConnectionId,
    ctx: &GatewayContext,
    group: &str,
) -> Result<bool, GroupError> {
    let left = ctx.registry.leave(id, group).await?;
    if left && ctx.session.announce_presence {
        announce(ctx, group, id, PresenceEvent::Left).await;
    }
    Ok(left)
}

/// Best-effort presence notice; failures are logged only.
pub(crate) async fn announce(
    ctx: &GatewayContext,
    group: &str,
    connection: &ConnectionId,
    event: PresenceEvent,
) {
    if let Err(e) = ctx.broadcaster.announce(group, connection, event).await {
        warn!(group, connection_id = %connection, ?event, error = %e, "presence notice failed");
    }
}

/// Publish through the broadcaster, retrying `PublishFailed` with backoff.
///
/// A rejected publish never consumes its sequence number, so every attempt
/// carries the same one.
pub async fn publish_with_retry(
    ctx: &GatewayContext,
    group: &str,
    sender: &ConnectionId,
    payload: Value,
) -> Result<Message, GroupError> {
    let retry = &ctx.session.publish_retry;
    let mut attempt: u32 = 0;
    loop {
        match ctx.broadcaster.publish(group, sender, payload.clone()).await {
            Ok(message) => return Ok(message),
            Err(e) if e.is_retryable() && retry.allows(attempt) => {
                let delay = retry.delay_for(attempt, rand::random());
                debug!(group, attempt, delay_ms = delay.as_millis(), "retrying publish");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use groupcast_broker::MemoryBroker;
    use groupcast_core::protocol::INVALID_COMMAND;
    use groupcast_core::retry::RetryConfig;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::config::ServerConfig;

    fn make_ctx(broker: &MemoryBroker, retries: u32) -> GatewayContext {
        let mut config = ServerConfig::default();
        config.session.publish_retry = RetryConfig {
            max_retries: retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
        };
        GatewayContext::new(Arc::new(broker.clone()), &config)
    }

    async fn connect(
        ctx: &GatewayContext,
        id: &str,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = Arc::new(ClientConnection::new(ConnectionId::from(id), tx));
        let _ = conn.activate();
        ctx.registry.register(Arc::clone(&conn)).await;
        (conn, rx)
    }

    async fn next_json(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn join_send_leave_are_acked() {
        let broker = MemoryBroker::new();
        let ctx = make_ctx(&broker, 0);
        let (conn, _rx) = connect(&ctx, "a").await;

        let reply = handle_message(r#"{"command":"join","group":"g"}"#, &conn, &ctx, None).await;
        assert_eq!(reply, ack(CommandKind::Join, "g".into(), None));
        assert!(conn.is_member_of("g"));

        let reply = handle_message(
            r#"{"command":"send","group":"g","payload":{"x":1}}"#,
            &conn,
            &ctx,
            None,
        )
        .await;
        assert_eq!(reply, ack(CommandKind::Send, "g".into(), Some(0)));

        let reply = handle_message(r#"{"command":"leave","group":"g"}"#, &conn, &ctx, None).await;
        assert_eq!(reply, ack(CommandKind::Leave, "g".into(), None));
        assert!(!conn.is_member_of("g"));
    }

    #[tokio::test]
    async fn repeated_join_and_stray_leave_still_ack() {
        let broker = MemoryBroker::new();
        let ctx = make_ctx(&broker, 0);
        let (conn, _rx) = connect(&ctx, "a").await;
        let join = r#"{"command":"join","group":"g"}"#;
        let _ = handle_message(join, &conn, &ctx, None).await;
        assert_eq!(
            handle_message(join, &conn, &ctx, None).await,
            ack(CommandKind::Join, "g".into(), None)
        );
        assert_eq!(
            handle_message(r#"{"command":"leave","group":"other"}"#, &conn, &ctx, None).await,
            ack(CommandKind::Leave, "other".into(), None)
        );
    }

    #[tokio::test]
    async fn malformed_frame_is_invalid_command() {
        let broker = MemoryBroker::new();
        let ctx = make_ctx(&broker, 0);
        let (conn, _rx) = connect(&ctx, "a").await;
        for frame in ["not json", r#"{"command":"dance","group":"g"}"#, r#"{"group":"g"}"#] {
            let reply = handle_message(frame, &conn, &ctx, None).await;
            let ServerEvent::Error { code, command, .. } = reply else {
                panic!("expected error for {frame}");
            };
            assert_eq!(code, INVALID_COMMAND);
            assert_eq!(command, None);
        }
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn room_frame_becomes_implicit_send() {
        let broker = MemoryBroker::new();
        let ctx = make_ctx(&broker, 0);
        let (a, _rx_a) = connect(&ctx, "a").await;
        let (b, mut rx_b) = connect(&ctx, "b").await;
        let _ = ctx.registry.join(&b.id, "room").await.unwrap();

        let reply = handle_message(r#"{"message":"hello"}"#, &a, &ctx, Some("room")).await;
        assert_eq!(reply, ack(CommandKind::Send, "room".into(), Some(0)));
        let got = next_json(&mut rx_b).await;
        assert_eq!(got["payload"], json!({"message": "hello"}));

        let _ = handle_message("plain text", &a, &ctx, Some("room")).await;
        let got = next_json(&mut rx_b).await;
        assert_eq!(got["payload"], "plain text");
        assert_eq!(got["seq"], 1);
    }

    #[tokio::test]
    async fn invalid_group_reports_code() {
        let broker = MemoryBroker::new();
        let ctx = make_ctx(&broker, 0);
        let (conn, _rx) = connect(&ctx, "a").await;
        let reply = handle_message(r#"{"command":"join","group":"a b"}"#, &conn, &ctx, None).await;
        let ServerEvent::Error { code, command, group, .. } = reply else {
            panic!("expected error");
        };
        assert_eq!(code, "INVALID_GROUP");
        assert_eq!(command, Some(CommandKind::Join));
        assert_eq!(group.as_deref(), Some("a b"));
    }

    #[tokio::test]
    async fn exhausted_retries_report_publish_failed() {
        let broker = MemoryBroker::new();
        let ctx = make_ctx(&broker, 2);
        let (conn, _rx) = connect(&ctx, "a").await;
        broker.set_available(false);
        let reply = handle_message(
            r#"{"command":"send","group":"g","payload":1}"#,
            &conn,
            &ctx,
            None,
        )
        .await;
        let ServerEvent::Error { code, .. } = reply else {
            panic!("expected error");
        };
        assert_eq!(code, "PUBLISH_FAILED");
        assert_eq!(ctx.broadcaster.next_seq(&conn.id, "g").await, 0);
    }

    #[tokio::test]
    async fn retry_succeeds_with_same_sequence() {
        let broker = MemoryBroker::new();
        let mut config = ServerConfig::default();
        config.session.publish_retry = RetryConfig {
            max_retries: 10,
            base_delay_ms: 20,
            max_delay_ms: 20,
            jitter_factor: 0.0,
        };
        let ctx = GatewayContext::new(Arc::new(broker.clone()), &config);
        let (conn, _rx) = connect(&ctx, "a").await;
        let _ = publish_with_retry(&ctx, "g", &conn.id, Value::Null).await.unwrap();

        broker.set_available(false);
        let restore = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                broker.set_available(true);
            })
        };
        let message = publish_with_retry(&ctx, "g", &conn.id, Value::Null).await.unwrap();
        restore.await.unwrap();
        assert_eq!(message.seq, 1);
    }

    #[tokio::test]
    async fn presence_announced_to_others() {
        let broker = MemoryBroker::new();
        let ctx = make_ctx(&broker, 0);
        let (a, mut rx_a) = connect(&ctx, "a").await;
        let (b, _rx_b) = connect(&ctx, "b").await;
        assert!(join_group(&a, &ctx, "g").await.unwrap());
        assert!(join_group(&b, &ctx, "g").await.unwrap());
        let got = next_json(&mut rx_a).await;
        assert_eq!(got["type"], "member.joined");
        assert_eq!(got["connection"], "b");

        assert!(leave_group(&b.id, &ctx, "g").await.unwrap());
        let got = next_json(&mut rx_a).await;
        assert_eq!(got["type"], "member.left");
    }
}

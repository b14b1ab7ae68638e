//! WebSocket session lifecycle: handles a single connected client from
//! upgrade through disconnect.
//!
//! Closing runs in a fixed order. The session leaves every group and then
//! unregisters. Only after that is the outbound queue released. Deliveries
//! racing the teardown therefore land in a live queue or are refused by
//! membership, never in a half-removed state.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use groupcast_core::{CommandKind, ConnectionId, PresenceEvent, ServerEvent};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, CloseReason};
use super::handler::{announce, handle_message, join_group};
use super::heartbeat::{Verdict, Watchdog, tick_period};
use crate::context::GatewayContext;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Upper bound on flushing the final Close frame to a stalled client.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-session parameters.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Interval between server Ping frames.
    pub heartbeat_interval: Duration,
    /// Close a client silent for this long.
    pub heartbeat_timeout: Duration,
    /// Room to auto-join; also the target of implicit sends.
    pub room: Option<String>,
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection and queues `connection.established`
/// 2. Auto-joins the room, if any; a failed join closes the session
/// 3. Dispatches incoming text frames as commands, one at a time
/// 4. Forwards queued frames and periodic Pings on a write task
/// 5. On close: leaves all groups, unregisters, then releases the queue
#[instrument(skip_all, fields(connection_id = %id.short(), room = options.room.as_deref()))]
pub async fn run_session(
    ws: WebSocket,
    id: ConnectionId,
    ctx: Arc<GatewayContext>,
    options: SessionOptions,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(ctx.session.outbound_capacity.max(1));
    let conn = Arc::new(ClientConnection::new(id, send_tx));

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    ctx.registry.register(Arc::clone(&conn)).await;
    let _ = conn.activate();
    let _ = conn.send_event(&ServerEvent::ConnectionEstablished {
        connection: conn.id.clone(),
    });

    // Outbound forwarder with periodic Ping frames. Returns the receiver so
    // the queue outlives group teardown.
    let writer = {
        let conn = Arc::clone(&conn);
        let interval = tick_period(options.heartbeat_interval);
        tokio::spawn(async move {
            let mut ping = time::interval_at(time::Instant::now() + interval, interval);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let outbound = tokio::select! {
                    biased;
                    () = conn.closed() => break,
                    frame = send_rx.recv() => match frame {
                        Some(text) => WsMessage::Text(text.as_str().into()),
                        None => break,
                    },
                    _ = ping.tick() => WsMessage::Ping(Bytes::new()),
                };
                let sent = tokio::select! {
                    biased;
                    () = conn.closed() => break,
                    sent = ws_tx.send(outbound) => sent,
                };
                if let Err(e) = sent {
                    debug!(error = %e, "websocket write failed");
                    conn.close(CloseReason::TransportError);
                    break;
                }
            }

            let reason = conn.close_reason().unwrap_or(CloseReason::ClientClosed);
            let frame = WsMessage::Close(Some(CloseFrame {
                code: reason.code(),
                reason: reason.as_str().into(),
            }));
            // the peer may already be gone
            let _ = time::timeout(CLOSE_FRAME_TIMEOUT, ws_tx.send(frame)).await;
            send_rx
        })
    };

    let heartbeat_cancel = CancellationToken::new();
    let heartbeat = {
        let conn = Arc::clone(&conn);
        let cancel = heartbeat_cancel.clone();
        let timeout = options.heartbeat_timeout;
        let watchdog = Watchdog::new(options.heartbeat_interval, timeout);
        tokio::spawn(async move {
            if watchdog.watch(Arc::clone(&conn), cancel).await == Verdict::Unresponsive {
                warn!(
                    connection_id = %conn.id,
                    silent_for = ?conn.last_seen_elapsed(),
                    "client unresponsive for {timeout:?}, disconnecting"
                );
                conn.close(CloseReason::HeartbeatTimeout);
            }
        })
    };

    if let Some(room) = options.room.as_deref() {
        if let Err(e) = join_group(&conn, &ctx, room).await {
            warn!(room, error = %e, "auto-join failed");
            let _ = conn.send_event(&ServerEvent::from_error(Some(CommandKind::Join), &e));
            conn.close(CloseReason::JoinFailed);
        }
    }

    // Commands are handled one at a time and never cancelled mid-flight.
    loop {
        let frame = tokio::select! {
            biased;
            () = conn.closed() => break,
            () = shutdown.cancelled() => {
                conn.close(CloseReason::Shutdown);
                break;
            }
            frame = ws_rx.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                conn.close(CloseReason::TransportError);
                break;
            }
            None => {
                conn.close(CloseReason::ClientClosed);
                break;
            }
        };
        conn.mark_alive();

        let text = match msg {
            WsMessage::Text(t) => t.as_str().to_owned(),
            WsMessage::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    info!(len = data.len(), "received non-UTF8 binary frame");
                    continue;
                }
            },
            WsMessage::Close(_) => {
                info!("client sent close frame");
                conn.close(CloseReason::ClientClosed);
                break;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };

        let reply = handle_message(&text, &conn, &ctx, options.room.as_deref()).await;
        if conn.send_event(&reply).is_err() {
            break;
        }
    }

    conn.close(CloseReason::ClientClosed);
    let reason = conn.close_reason().unwrap_or(CloseReason::ClientClosed);
    teardown(&conn, &ctx).await;

    heartbeat_cancel.cancel();
    let _ = heartbeat.await;
    match writer.await {
        Ok(send_rx) => drop(send_rx),
        Err(e) => warn!(error = %e, "write task ended abnormally"),
    }
    conn.mark_closed();

    info!(%reason, enqueued = conn.enqueued_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
}

/// Leave every group, then unregister.
async fn teardown(conn: &Arc<ClientConnection>, ctx: &GatewayContext) {
    let groups = conn.begin_closing().unwrap_or_default();
    for group in &groups {
        match ctx.registry.leave_connection(conn, group).await {
            Ok(true) if ctx.session.announce_presence => {
                announce(ctx, group, &conn.id, PresenceEvent::Left).await;
            }
            Ok(_) => {}
            Err(e) => warn!(group, error = %e, "leave during close failed"),
        }
    }
    let _ = ctx.registry.unregister(&conn.id).await;
    ctx.broadcaster.forget_sender(&conn.id);
    debug!(groups = groups.len(), "session torn down");
}

//! End-to-end integration tests using a real WebSocket client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use groupcast_broker::MemoryBroker;
use groupcast_core::{
    CommandKind, ConnectionId, InboundFrame, Message, SequenceTracker, ServerEvent,
};
use groupcast_server::{GroupcastServer, ServerConfig};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    base: String,
    addr: std::net::SocketAddr,
    server: Arc<GroupcastServer>,
    broker: MemoryBroker,
}

/// Boot a test server on an auto-assigned port.
async fn boot_with(config: ServerConfig) -> TestServer {
    let broker = MemoryBroker::new();
    let server = Arc::new(GroupcastServer::new(config, Arc::new(broker.clone())));
    let (addr, _handle) = server.listen().await.unwrap();
    TestServer {
        base: format!("ws://{addr}"),
        addr,
        server,
        broker,
    }
}

async fn boot() -> TestServer {
    boot_with(ServerConfig::default()).await
}

/// Connect and consume the `connection.established` frame.
async fn connect(url: &str) -> (WsStream, ConnectionId) {
    let (mut ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    match next_frame(&mut ws).await {
        InboundFrame::Event(ServerEvent::ConnectionEstablished { connection }) => (ws, connection),
        other => panic!("expected connection.established, got {other:?}"),
    }
}

async fn next_frame(ws: &mut WsStream) -> InboundFrame {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("frame ok");
        match msg {
            WsMessage::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("valid server frame");
            }
            WsMessage::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

async fn next_delivery(ws: &mut WsStream) -> Message {
    loop {
        if let InboundFrame::Delivery(message) = next_frame(ws).await {
            return message;
        }
    }
}

/// Read until a close frame arrives and return its code.
async fn next_close_code(ws: &mut WsStream) -> u16 {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("close within timeout")
            .expect("stream open")
            .expect("frame ok");
        if let WsMessage::Close(frame) = msg {
            return frame.map_or(1005, |f| u16::from(f.code));
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(WsMessage::Text(value.to_string().into())).await.unwrap();
}

/// Send a command and return its ack or error, skipping deliveries and presence.
async fn command(ws: &mut WsStream, value: Value) -> ServerEvent {
    send_json(ws, value).await;
    loop {
        match next_frame(ws).await {
            InboundFrame::Event(event @ (ServerEvent::Ack { .. } | ServerEvent::Error { .. })) => {
                return event;
            }
            _ => {}
        }
    }
}

async fn join(ws: &mut WsStream, group: &str) {
    let reply = command(ws, json!({"command": "join", "group": group})).await;
    assert!(
        matches!(reply, ServerEvent::Ack { command: CommandKind::Join, .. }),
        "join failed: {reply:?}"
    );
}

async fn send(ws: &mut WsStream, group: &str, payload: Value) -> u64 {
    let reply = command(
        ws,
        json!({"command": "send", "group": group, "payload": payload}),
    )
    .await;
    match reply {
        ServerEvent::Ack {
            command: CommandKind::Send,
            seq: Some(seq),
            ..
        } => seq,
        other => panic!("send failed: {other:?}"),
    }
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    let _ = timeout(TIMEOUT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

/// Collect deliveries until `publisher` sends `{"done": true}`.
///
/// Panics on the first gap or duplicate. Returns the tracker and how many
/// deliveries came from senders other than `publisher`.
async fn collect_until_done(mut ws: WsStream, publisher: ConnectionId) -> (SequenceTracker, usize) {
    let mut tracker = SequenceTracker::new();
    let mut others = 0;
    loop {
        let message = next_delivery(&mut ws).await;
        let observation = tracker.observe_message(&message);
        assert!(
            !observation.is_anomaly(),
            "{observation:?} from {} in {}",
            message.sender,
            message.group
        );
        if message.sender == publisher {
            if message.payload["done"] == true {
                return (tracker, others);
            }
        } else {
            others += 1;
        }
    }
}

/// Two stable receivers and a stable publisher share `group` while another
/// connection repeatedly connects, joins, sends once and disconnects.
async fn churn_scenario(base: &str, group: &'static str, min_cycles: usize, run_for: Duration) {
    let url = format!("{base}/ws");
    let (mut s1, _) = connect(&url).await;
    let (mut s2, _) = connect(&url).await;
    let (mut publisher, publisher_id) = connect(&url).await;
    join(&mut s1, group).await;
    join(&mut s2, group).await;

    let r1 = tokio::spawn(collect_until_done(s1, publisher_id.clone()));
    let r2 = tokio::spawn(collect_until_done(s2, publisher_id.clone()));

    let stop = Arc::new(AtomicBool::new(false));
    let pub_task = {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut sent = 0u64;
            while !stop.load(Ordering::Acquire) {
                let seq = send(&mut publisher, group, json!({"n": sent})).await;
                assert_eq!(seq, sent);
                sent += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let last = send(&mut publisher, group, json!({"done": true})).await;
            (last, publisher)
        })
    };

    let started = Instant::now();
    let mut cycles = 0;
    while cycles < min_cycles || started.elapsed() < run_for {
        let (mut churner, _) = connect(&url).await;
        join(&mut churner, group).await;
        let _ = send(&mut churner, group, json!({"churn": cycles})).await;
        churner.close(None).await.unwrap();
        drop(churner);
        cycles += 1;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    stop.store(true, Ordering::Release);
    let (last, _publisher) = pub_task.await.unwrap();
    for receiver in [r1, r2] {
        let (tracker, churn_deliveries) = timeout(TIMEOUT, receiver).await.unwrap().unwrap();
        assert_eq!(tracker.gap_count(), 0);
        assert_eq!(tracker.last_seen(group, &publisher_id), Some(last));
        assert_eq!(churn_deliveries, cycles);
    }
}

#[tokio::test]
async fn established_frame_carries_connection_id() {
    let t = boot().await;
    let (_ws, id) = connect(&format!("{}/ws", t.base)).await;
    assert_eq!(id.len(), 36);
}

#[tokio::test]
async fn two_members_receive_ten_in_order_then_sender_churns() {
    let t = boot().await;
    let url = format!("{}/ws", t.base);

    let (mut c2, _) = connect(&url).await;
    join(&mut c2, "room_a").await;
    let (mut c1, c1_id) = connect(&url).await;
    join(&mut c1, "room_a").await;

    for expected in 0..10 {
        assert_eq!(send(&mut c1, "room_a", json!({"i": expected})).await, expected);
    }
    for expected in 0..10 {
        let message = next_delivery(&mut c2).await;
        assert_eq!(message.sender, c1_id);
        assert_eq!(message.group, "room_a");
        assert_eq!(message.seq, expected);
        assert_eq!(message.payload["i"], expected);
    }

    // C3 watches room_b traffic while C1 reconnects 20 times.
    let (mut c3, _) = connect(&url).await;
    join(&mut c3, "room_b").await;
    let (mut feeder, feeder_id) = connect(&url).await;
    let c3_task = tokio::spawn(collect_until_done(c3, feeder_id));

    c1.close(None).await.unwrap();
    drop(c1);
    for round in 0..20 {
        let _ = send(&mut feeder, "room_b", json!({"round": round})).await;
        let (mut c1, c1_id) = connect(&url).await;
        join(&mut c1, "room_a").await;
        assert_eq!(send(&mut c1, "room_a", json!({"round": round})).await, 0);
        let message = next_delivery(&mut c2).await;
        assert_eq!(message.sender, c1_id);
        assert_eq!(message.seq, 0);
        c1.close(None).await.unwrap();
    }
    let _ = send(&mut feeder, "room_b", json!({"done": true})).await;

    let (tracker, _) = timeout(TIMEOUT, c3_task).await.unwrap().unwrap();
    assert_eq!(tracker.gap_count(), 0);
    assert_eq!(tracker.duplicate_count(), 0);
}

#[tokio::test]
async fn disconnect_in_one_group_does_not_disturb_another() {
    let t = boot().await;
    let url = format!("{}/ws", t.base);

    let (mut b_receiver, _) = connect(&url).await;
    join(&mut b_receiver, "group_b").await;
    let (mut b_sender, b_sender_id) = connect(&url).await;
    let receiver = tokio::spawn(collect_until_done(b_receiver, b_sender_id));

    for i in 0..30 {
        let (mut a, _) = connect(&url).await;
        join(&mut a, "group_a").await;
        let _ = send(&mut b_sender, "group_b", json!({"i": i})).await;
        if i % 2 == 0 {
            a.close(None).await.unwrap();
        } else {
            // abrupt: drop the socket without a close handshake
            drop(a);
        }
    }
    let last = send(&mut b_sender, "group_b", json!({"done": true})).await;
    assert_eq!(last, 30);

    let (tracker, _) = timeout(TIMEOUT, receiver).await.unwrap().unwrap();
    assert_eq!(tracker.gap_count(), 0);
}

#[tokio::test]
async fn rapid_connect_join_disconnect_keeps_stable_members_gapless() {
    let t = boot().await;
    churn_scenario(&t.base, "churn_room", 50, Duration::ZERO).await;
}

/// The long-running variant; `GROUPCAST_SOAK_SECS` sets the duration (default 300).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "soak test, minutes long"]
async fn soak_rapid_churn() {
    let secs = std::env::var("GROUPCAST_SOAK_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300);
    let t = boot().await;
    churn_scenario(&t.base, "soak_room", 50, Duration::from_secs(secs)).await;
}

#[tokio::test]
async fn publish_to_empty_group_succeeds_without_leaking() {
    let t = boot().await;
    let (mut ws, _) = connect(&format!("{}/ws", t.base)).await;
    assert_eq!(send(&mut ws, "nobody_here", json!(1)).await, 0);
    assert_eq!(send(&mut ws, "nobody_here", json!(2)).await, 1);
    assert_eq!(t.broker.topic_count(), 0);
    assert!(t.server.context().bridge().arena().is_empty());
}

#[tokio::test]
async fn room_endpoint_auto_joins_and_publishes_plain_frames() {
    let t = boot().await;
    let (mut alice, alice_id) = connect(&format!("{}/ws/chat/lobby/", t.base)).await;
    let (mut bob, bob_id) = connect(&format!("{}/ws/chat/lobby", t.base)).await;

    // alice hears bob arrive
    match next_frame(&mut alice).await {
        InboundFrame::Event(ServerEvent::MemberJoined { group, connection }) => {
            assert_eq!(group, "lobby");
            assert_eq!(connection, bob_id);
        }
        other => panic!("expected member.joined, got {other:?}"),
    }

    send_json(&mut bob, json!({"message": "hi"})).await;
    let message = next_delivery(&mut alice).await;
    assert_eq!(message.sender, bob_id);
    assert_eq!(message.payload, json!({"message": "hi"}));

    // bob gets his ack but never his own message
    match next_frame(&mut bob).await {
        InboundFrame::Event(ServerEvent::Ack { command, seq, .. }) => {
            assert_eq!(command, CommandKind::Send);
            assert_eq!(seq, Some(0));
        }
        other => panic!("expected ack, got {other:?}"),
    }

    bob.close(None).await.unwrap();
    match next_frame(&mut alice).await {
        InboundFrame::Event(ServerEvent::MemberLeft { connection, .. }) => {
            assert_eq!(connection, bob_id);
        }
        other => panic!("expected member.left, got {other:?}"),
    }
    assert_eq!(
        t.server.context().registry.members("lobby").await,
        vec![alice_id]
    );
}

#[tokio::test]
async fn invalid_room_name_is_bad_request() {
    let t = boot().await;
    let err = connect_async(format!("{}/ws/chat/bad%20room", t.base))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 400),
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_auto_join_closes_session() {
    let t = boot().await;
    t.broker.set_available(false);
    let (mut ws, _) = connect_async(format!("{}/ws/chat/lobby", t.base))
        .await
        .unwrap();
    assert_eq!(next_close_code(&mut ws).await, 1011);
    t.broker.set_available(true);
}

#[tokio::test]
async fn malformed_command_keeps_connection_open() {
    let t = boot().await;
    let (mut ws, _) = connect(&format!("{}/ws", t.base)).await;
    ws.send(WsMessage::Text("{nope".into())).await.unwrap();
    match next_frame(&mut ws).await {
        InboundFrame::Event(ServerEvent::Error { code, .. }) => assert_eq!(code, "INVALID_COMMAND"),
        other => panic!("expected error, got {other:?}"),
    }
    join(&mut ws, "still_here").await;
}

#[tokio::test]
async fn invalid_group_is_reported() {
    let t = boot().await;
    let (mut ws, _) = connect(&format!("{}/ws", t.base)).await;
    match command(&mut ws, json!({"command": "join", "group": ""})).await {
        ServerEvent::Error { code, command, .. } => {
            assert_eq!(code, "INVALID_GROUP");
            assert_eq!(command, Some(CommandKind::Join));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn upgrades_beyond_limit_get_503() {
    let t = boot_with(ServerConfig {
        max_connections: 2,
        ..ServerConfig::default()
    })
    .await;
    let url = format!("{}/ws", t.base);
    let (_a, _) = connect(&url).await;
    let (b, _) = connect(&url).await;

    match connect_async(url.as_str()).await.unwrap_err() {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 503),
        other => panic!("expected HTTP 503, got {other:?}"),
    }

    drop(b);
    // the slot frees once the session finishes tearing down
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if connect_async(url.as_str()).await.is_ok() {
            break;
        }
        assert!(Instant::now() < deadline, "slot never freed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn health_reports_live_counts() {
    let t = boot().await;
    let (mut ws, _) = connect(&format!("{}/ws", t.base)).await;
    join(&mut ws, "g1").await;
    join(&mut ws, "g2").await;

    let response = http_get(t.addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let health: Value = serde_json::from_str(body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);
    assert_eq!(health["groups"], 2);
    assert_eq!(health["active_subscriptions"], 2);
}

#[tokio::test]
async fn shutdown_closes_sessions_with_going_away() {
    let t = boot().await;
    let (mut ws, _) = connect(&format!("{}/ws", t.base)).await;
    join(&mut ws, "g").await;

    let server = Arc::clone(&t.server);
    let shutdown = tokio::spawn(async move { server.shutdown().await });
    assert_eq!(next_close_code(&mut ws).await, 1001);
    assert!(timeout(TIMEOUT, shutdown).await.unwrap().unwrap());

    assert_eq!(t.server.context().registry.connection_count().await, 0);
    assert!(t.server.context().bridge().arena().is_empty());
    assert_eq!(t.broker.topic_count(), 0);
}

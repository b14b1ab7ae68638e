//! Client simulator.
//!
//! Connects to a room endpoint, sends a numbered payload every interval and
//! checks each delivery against the last sequence number seen from its
//! sender. The first gap ends the run with a non-zero exit.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use futures::{SinkExt, StreamExt};
use groupcast_core::protocol::validate_group_name;
use groupcast_core::{ConnectionId, InboundFrame, SeqObservation, SequenceTracker, ServerEvent};
use serde_json::json;
use tokio::time::{self, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

/// Extra time to collect deliveries after the last send.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Arguments for `groupcast client`.
#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Room to join.
    room: String,

    /// Server base URL.
    #[arg(long, default_value = "ws://127.0.0.1:8000")]
    url: String,

    /// Milliseconds between sends.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Stop after this many sends. Runs until ctrl-c when unset.
    #[arg(long)]
    count: Option<u64>,
}

/// How a client run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientOutcome {
    /// No gaps observed.
    Clean,
    /// A delivery skipped sequence numbers.
    Dropped,
    /// The server closed this client with an error code, e.g. overflow.
    ServerClosed,
}

impl ClientOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Clean => ExitCode::SUCCESS,
            Self::Dropped | Self::ServerClosed => ExitCode::FAILURE,
        }
    }
}

/// `{base}/ws/chat/{room}/`
fn room_url(base: &str, room: &str) -> String {
    format!("{}/ws/chat/{room}/", base.trim_end_matches('/'))
}

/// Verdict on a single inbound frame.
#[derive(Debug, PartialEq)]
enum Verdict {
    /// Nothing to report.
    Quiet,
    /// Worth printing, not a failure.
    Notice(String),
    /// Sequence numbers were skipped.
    Dropped(String),
}

/// Per-sender gap detection over raw frames.
#[derive(Debug, Default)]
struct DropChecker {
    tracker: SequenceTracker,
    delivered: u64,
}

impl DropChecker {
    fn observe(&mut self, text: &str) -> Verdict {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => return Verdict::Notice(format!("unparseable frame ({e}): {text}")),
        };
        match frame {
            InboundFrame::Delivery(message) => {
                self.delivered += 1;
                match self.tracker.observe_message(&message) {
                    SeqObservation::Gap { expected, got } => Verdict::Dropped(format!(
                        "server dropped a message: {} in {} expected seq {expected}, got {got}",
                        message.sender.short(),
                        message.group
                    )),
                    SeqObservation::Duplicate { last, got } => Verdict::Notice(format!(
                        "duplicate from {}: seq {got} after {last}",
                        message.sender.short()
                    )),
                    SeqObservation::First | SeqObservation::InOrder => {
                        debug!(sender = %message.sender.short(), seq = message.seq, "delivery");
                        Verdict::Quiet
                    }
                }
            }
            InboundFrame::Event(ServerEvent::MemberJoined { group, connection }) => {
                Verdict::Notice(format!("{} joined {group}", connection.short()))
            }
            InboundFrame::Event(ServerEvent::MemberLeft { group, connection }) => {
                self.tracker.forget(&group, &connection);
                Verdict::Notice(format!("{} left {group}", connection.short()))
            }
            InboundFrame::Event(ServerEvent::GroupResubscribed { group }) => {
                // an announced broker gap is not a server drop
                self.tracker.forget_group(&group);
                Verdict::Notice(format!("server resubscribed {group}; messages may be missing"))
            }
            InboundFrame::Event(ServerEvent::Error { code, message, .. }) => {
                Verdict::Notice(format!("error {code}: {message}"))
            }
            InboundFrame::Event(_) => Verdict::Quiet,
        }
    }
}

/// Outcome and report line for a server Close frame.
///
/// Only normal closure (1000) and going away (1001) end a run cleanly; any
/// other code means the server cut this client off.
fn close_outcome(code: Option<u16>, reason: &str) -> (ClientOutcome, String) {
    match code {
        None => (ClientOutcome::Clean, "server closed".to_owned()),
        Some(code @ (1000 | 1001)) => (
            ClientOutcome::Clean,
            format!("server closed: {code} {reason}"),
        ),
        Some(code) => (
            ClientOutcome::ServerClosed,
            format!("server closed this client: {code} {reason}"),
        ),
    }
}

/// Wait for `connection.established` and return the assigned identity.
async fn established<S>(stream: &mut S) -> Result<ConnectionId>
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        if let WsMessage::Text(text) = frame.context("WebSocket error before handshake")? {
            if let Ok(InboundFrame::Event(ServerEvent::ConnectionEstablished { connection })) =
                serde_json::from_str(text.as_str())
            {
                return Ok(connection);
            }
        }
    }
    bail!("server closed before connection.established")
}

/// Run the simulator until `count` sends have drained, ctrl-c, or a gap.
pub async fn run(args: ClientArgs) -> Result<ClientOutcome> {
    validate_group_name(&args.room).context("Invalid room name")?;
    let url = room_url(&args.url, &args.room);
    let (ws, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    let (mut sink, mut stream) = ws.split();

    let me = established(&mut stream).await?;
    println!("connected to {url} as {}", me.short());

    let interval = Duration::from_millis(args.interval_ms.max(1));
    let mut ticker = time::interval(interval);
    let mut checker = DropChecker::default();
    let mut sent: u64 = 0;
    let mut drain_until = (args.count == Some(0)).then(|| Instant::now() + DRAIN_GRACE);

    let outcome = loop {
        let sending = drain_until.is_none();
        let deadline = drain_until.unwrap_or_else(Instant::now);
        tokio::select! {
            _ = ticker.tick(), if sending => {
                let payload = json!({"count": sent, "client": me.short()});
                sink.send(WsMessage::Text(payload.to_string().into()))
                    .await
                    .context("Failed to send")?;
                sent += 1;
                if args.count.is_some_and(|count| sent >= count) {
                    drain_until = Some(Instant::now() + interval + DRAIN_GRACE);
                }
            }
            () = time::sleep_until(deadline), if !sending => break ClientOutcome::Clean,
            _ = tokio::signal::ctrl_c() => break ClientOutcome::Clean,
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match checker.observe(text.as_str()) {
                    Verdict::Quiet => {}
                    Verdict::Notice(line) => println!("{line}"),
                    Verdict::Dropped(line) => {
                        eprintln!("{line}");
                        break ClientOutcome::Dropped;
                    }
                },
                Some(Ok(WsMessage::Close(close))) => {
                    let (outcome, line) = match close {
                        Some(close) => close_outcome(Some(u16::from(close.code)), close.reason.as_str()),
                        None => close_outcome(None, ""),
                    };
                    if outcome == ClientOutcome::Clean {
                        println!("{line}");
                    } else {
                        eprintln!("{line}");
                    }
                    break outcome;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("WebSocket error"),
                None => break ClientOutcome::Clean,
            },
        }
    };

    // the server may already be gone
    let _ = sink.close().await;
    println!(
        "sent {sent}, received {} deliveries, {} gaps",
        checker.delivered,
        checker.tracker.gap_count()
    );
    Ok(outcome)
}

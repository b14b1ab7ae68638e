//! Per-connection state shared by the session tasks and the group core.
//!
//! A [`ClientConnection`] is owned by its session task. The registry and
//! group arena only hold `Arc` references to it for delivery.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use groupcast_core::{ConnectionId, GroupError, ServerEvent};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use crate::metrics::OUTBOUND_OVERFLOWS_TOTAL;

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded, handshake frame not yet queued.
    Connecting,
    /// Accepting commands and deliveries.
    Active,
    /// Leaving groups; no new memberships accepted.
    Closing,
    /// Terminal.
    Closed,
}

/// Why a connection was closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the socket.
    ClientClosed,
    /// Reading or writing the socket failed.
    TransportError,
    /// The outbound queue filled up.
    Overflow,
    /// No frame received within the heartbeat timeout.
    HeartbeatTimeout,
    /// The auto-join of a room endpoint failed.
    JoinFailed,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code sent to the client.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::ClientClosed | Self::TransportError => 1000,
            Self::Shutdown => 1001,
            Self::Overflow => 1008,
            Self::HeartbeatTimeout | Self::JoinFailed => 1011,
        }
    }

    /// Short reason text for the close frame and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client closed",
            Self::TransportError => "transport error",
            Self::Overflow => "outbound queue overflow",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::JoinFailed => "join failed",
            Self::Shutdown => "server shutting down",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Lifecycle {
    state: ConnectionState,
    groups: BTreeSet<String>,
}

/// One WebSocket peer: outbound queue, lifecycle, group memberships.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Bounded queue drained by the session's write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Upgrade time.
    pub connected_at: Instant,
    /// Whether any frame arrived since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// When the last frame (of any kind) was received.
    last_seen: Mutex<Instant>,
    /// State and group memberships, mutated together.
    lifecycle: Mutex<Lifecycle>,
    /// Fired once when the connection must close.
    close: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    /// Frames accepted into the outbound queue.
    enqueued: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection in the `Connecting` state.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Connecting,
                groups: BTreeSet::new(),
            }),
            close: CancellationToken::new(),
            close_reason: Mutex::new(None),
            enqueued: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    /// `Connecting` → `Active`. Returns `false` from any other state.
    pub fn activate(&self) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.state == ConnectionState::Connecting {
            lc.state = ConnectionState::Active;
            true
        } else {
            false
        }
    }

    /// Record membership of `group`.
    ///
    /// Fails with `InvalidConnection` once the connection is closing, so a
    /// join racing a disconnect can never leave a stale membership behind.
    /// Returns `false` if the group was already recorded.
    pub fn add_group(&self, group: &str) -> Result<bool, GroupError> {
        let mut lc = self.lifecycle.lock();
        if lc.state != ConnectionState::Active {
            return Err(GroupError::InvalidConnection(self.id.clone()));
        }
        Ok(lc.groups.insert(group.to_owned()))
    }

    /// Forget membership of `group`. Returns whether it was recorded.
    pub fn remove_group(&self, group: &str) -> bool {
        self.lifecycle.lock().groups.remove(group)
    }

    /// Groups this connection currently belongs to.
    pub fn groups(&self) -> Vec<String> {
        self.lifecycle.lock().groups.iter().cloned().collect()
    }

    /// Whether `group` is recorded.
    pub fn is_member_of(&self, group: &str) -> bool {
        self.lifecycle.lock().groups.contains(group)
    }

    /// Enter `Closing` and return the groups to leave.
    ///
    /// Returns `None` if closing already began.
    pub fn begin_closing(&self) -> Option<Vec<String>> {
        let mut lc = self.lifecycle.lock();
        match lc.state {
            ConnectionState::Connecting | ConnectionState::Active => {
                lc.state = ConnectionState::Closing;
                Some(lc.groups.iter().cloned().collect())
            }
            ConnectionState::Closing | ConnectionState::Closed => None,
        }
    }

    /// Enter the terminal state.
    pub fn mark_closed(&self) {
        self.lifecycle.lock().state = ConnectionState::Closed;
    }

    /// Ask the session to close. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
                debug!(connection_id = %self.id, %reason, "close requested");
            }
        }
        self.close.cancel();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close.cancelled()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_close_requested(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Reason passed to the first [`close`](Self::close) call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Enqueue a frame for the client.
    ///
    /// A full queue closes the connection with [`CloseReason::Overflow`] and
    /// returns [`GroupError::Overflow`]; nothing is dropped silently while
    /// the connection stays open. A released queue means the session has
    /// already finished tearing down, so the frame is discarded.
    pub fn deliver(&self, frame: Arc<String>) -> Result<(), GroupError> {
        match self.tx.try_send(frame) {
            Ok(()) => {
                let _ = self.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                if !self.is_close_requested() {
                    warn!(connection_id = %self.id, "outbound queue full, closing connection");
                    counter!(OUTBOUND_OVERFLOWS_TOTAL).increment(1);
                }
                self.close(CloseReason::Overflow);
                Err(GroupError::Overflow(self.id.clone()))
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %self.id, "outbound queue released, discarding frame");
                Ok(())
            }
        }
    }

    /// Serialize and enqueue a server event.
    pub fn send_event(&self, event: &ServerEvent) -> Result<(), GroupError> {
        match serde_json::to_string(event) {
            Ok(json) => self.deliver(Arc::new(json)),
            Err(e) => Err(GroupError::Internal(format!("failed to encode event: {e}"))),
        }
    }

    /// Frames accepted into the outbound queue so far.
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Duration since the last inbound frame (or connection establishment).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Consume the alive flag, reporting whether any frame arrived since the
    /// previous call.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_connection(capacity: usize) -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = ClientConnection::new(ConnectionId::from("conn_1"), tx);
        (conn, rx)
    }

    #[test]
    fn starts_connecting_then_active() {
        let (conn, _rx) = make_connection(4);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.activate());
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(!conn.activate());
    }

    #[tokio::test]
    async fn deliver_in_order() {
        let (conn, mut rx) = make_connection(8);
        for i in 0..5 {
            conn.deliver(Arc::new(format!("msg_{i}"))).unwrap();
        }
        for i in 0..5 {
            assert_eq!(&*rx.recv().await.unwrap(), &format!("msg_{i}"));
        }
        assert_eq!(conn.enqueued_count(), 5);
    }

    #[tokio::test]
    async fn full_queue_is_overflow_and_closes() {
        let (conn, _rx) = make_connection(1);
        conn.deliver(Arc::new("first".into())).unwrap();
        let err = conn.deliver(Arc::new("second".into())).unwrap_err();
        assert_matches!(err, GroupError::Overflow(ref id) if id.as_str() == "conn_1");
        assert!(conn.is_close_requested());
        assert_eq!(conn.close_reason(), Some(CloseReason::Overflow));
        // closed() resolves immediately once requested
        conn.closed().await;
    }

    #[test]
    fn released_queue_discards() {
        let (conn, rx) = make_connection(1);
        drop(rx);
        assert!(conn.deliver(Arc::new("late".into())).is_ok());
        assert!(!conn.is_close_requested());
    }

    #[test]
    fn first_close_reason_wins() {
        let (conn, _rx) = make_connection(1);
        conn.close(CloseReason::HeartbeatTimeout);
        conn.close(CloseReason::Shutdown);
        assert_eq!(conn.close_reason(), Some(CloseReason::HeartbeatTimeout));
    }

    #[test]
    fn groups_rejected_once_closing() {
        let (conn, _rx) = make_connection(1);
        // not yet active
        assert_matches!(conn.add_group("g"), Err(GroupError::InvalidConnection(_)));
        let _ = conn.activate();
        assert!(conn.add_group("a").unwrap());
        assert!(!conn.add_group("a").unwrap());
        assert!(conn.add_group("b").unwrap());

        let groups = conn.begin_closing().unwrap();
        assert_eq!(groups, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_matches!(conn.add_group("c"), Err(GroupError::InvalidConnection(_)));
        assert!(conn.begin_closing().is_none());

        assert!(conn.remove_group("a"));
        assert!(!conn.remove_group("a"));
        conn.mark_closed();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn send_event_serializes() {
        let (conn, mut rx) = make_connection(2);
        conn.send_event(&ServerEvent::GroupResubscribed { group: "g".into() })
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(parsed["type"], "group.resubscribed");
        assert_eq!(parsed["group"], "g");
    }

    #[test]
    fn alive_flag_is_consumed_by_check() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseReason::ClientClosed.code(), 1000);
        assert_eq!(CloseReason::Shutdown.code(), 1001);
        assert_eq!(CloseReason::Overflow.code(), 1008);
        assert_eq!(CloseReason::HeartbeatTimeout.code(), 1011);
    }
}

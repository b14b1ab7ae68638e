//! `GroupcastServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use groupcast_broker::Broker;
use groupcast_core::ConnectionId;
use groupcast_core::protocol::validate_group_name;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::context::GatewayContext;
use crate::health::HealthReport;
use crate::metrics::WS_REJECTED_TOTAL;
use crate::shutdown::{self, ShutdownSignal};
use crate::websocket::connection::CloseReason;
use crate::websocket::session::{SessionOptions, run_session};

/// Handler state, cloned into every request.
#[derive(Clone)]
pub struct AppState {
    /// Group core.
    pub ctx: Arc<GatewayContext>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Triggered once shutdown begins.
    pub shutdown: Arc<ShutdownSignal>,
    /// Tracks running sessions for shutdown.
    pub sessions: TaskTracker,
    /// Upgrades accepted and not yet finished.
    pub open_sessions: Arc<AtomicUsize>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Startup instant, for uptime.
    pub start_time: Instant,
}

/// The groupcast server.
pub struct GroupcastServer {
    state: AppState,
}

impl GroupcastServer {
    /// Create a new server over `broker`.
    pub fn new(config: ServerConfig, broker: Arc<dyn Broker>) -> Self {
        let ctx = Arc::new(GatewayContext::new(broker, &config));
        Self {
            state: AppState {
                ctx,
                config: Arc::new(config),
                shutdown: Arc::new(ShutdownSignal::new()),
                sessions: TaskTracker::new(),
                open_sessions: Arc::new(AtomicUsize::new(0)),
                metrics: None,
                start_time: Instant::now(),
            },
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Routes: `/health`, `/metrics`, `/ws` and `/ws/chat/{room}`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .route("/ws/chat/{room}", get(room_handler))
            .route("/ws/chat/{room}/", get(room_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server stopped with error");
            }
        });
        info!(%addr, broker = self.state.ctx.bridge().broker_name(), "groupcast server listening");
        Ok((addr, handle))
    }

    /// Close every session and wait up to the configured timeout for them.
    ///
    /// Returns `false` if sessions were still running at the deadline.
    pub async fn shutdown(&self) -> bool {
        self.state.shutdown.trigger();
        let signalled = self.state.ctx.registry.close_all(CloseReason::Shutdown).await;
        debug!(signalled, "closing sessions");
        let closed = shutdown::drain(&self.state.sessions, self.state.config.shutdown_timeout).await;
        info!(closed, "groupcast server shut down");
        closed
    }

    /// The group core.
    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.state.ctx
    }

    /// The shutdown signal shared with every session.
    pub fn shutdown_signal(&self) -> &Arc<ShutdownSignal> {
        &self.state.shutdown
    }

    /// Effective configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Upgrades accepted and not yet finished.
    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::Acquire)
    }
}

/// Slot counted against `max_connections`, released on drop.
struct ConnectionPermit(Arc<AtomicUsize>);

impl ConnectionPermit {
    fn acquire(open: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let _ = open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(Self(Arc::clone(open)))
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    let bridge = state.ctx.bridge();
    Json(HealthReport {
        connections: state.ctx.registry.connection_count().await,
        groups: bridge.arena().len(),
        active_subscriptions: bridge.active_subscriptions(),
        ..HealthReport::new(state.start_time.elapsed(), state.shutdown.is_triggered())
    })
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /ws: plain command endpoint.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    upgrade(state, ws, None)
}

/// GET /ws/chat/{room}: auto-joined room endpoint.
async fn room_handler(
    State(state): State<AppState>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = validate_group_name(&room) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    upgrade(state, ws, Some(room))
}

fn upgrade(state: AppState, ws: WebSocketUpgrade, room: Option<String>) -> Response {
    if state.shutdown.is_triggered() {
        counter!(WS_REJECTED_TOTAL, "reason" => "shutdown").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }
    let Some(permit) = ConnectionPermit::acquire(&state.open_sessions, state.config.max_connections)
    else {
        warn!(max = state.config.max_connections, "connection limit reached");
        counter!(WS_REJECTED_TOTAL, "reason" => "limit").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    let id = ConnectionId::new();
    let options = SessionOptions {
        heartbeat_interval: state.config.heartbeat_interval,
        heartbeat_timeout: state.config.heartbeat_timeout,
        room,
    };
    let ctx = Arc::clone(&state.ctx);
    let shutdown = state.shutdown.token();
    let sessions = state.sessions.clone();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            sessions.track_future(async move {
                let _permit = permit;
                run_session(socket, id, ctx, options, shutdown).await;
            })
        })
}

//! HTTP and WebSocket surface of the relay.
//!
//! | Route          | Method | Purpose                                   |
//! |----------------|--------|-------------------------------------------|
//! | `/ws/video`    | GET    | JPEG frame subscription                   |
//! | `/ws/meta`     | GET    | Detection metadata subscription           |
//! | `/control`     | POST   | `?action=play` or `?action=pause`         |
//! | `/refresh`     | POST   | Reopen the camera now                     |
//! | `/status`      | GET    | Streaming flag, source state, subscribers |
//! | `/metrics`     | GET    | Prometheus text format                    |
//! | `/health`      | GET    | Liveness probe                            |

mod ws;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::capture::ServerConfig;
use crate::control::ControlResponse;
use crate::relay::{BroadcastStats, ChannelKind, Registry, RelayHandle};
use crate::source::SourceState;

/// Errors that can occur while serving.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to address: {0}")]
    Bind(#[from] std::io::Error),

    #[error("server error: {0}")]
    Server(String),
}

/// HTTP/WebSocket server in front of a running relay.
pub struct RelayServer {
    config: ServerConfig,
    relay: RelayHandle,
}

impl RelayServer {
    pub fn new(config: ServerConfig, relay: RelayHandle) -> Self {
        Self { config, relay }
    }

    /// Builds the application router.
    pub fn router(&self) -> Router {
        router(self.relay.clone())
    }

    /// Binds the configured address and serves until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), ServerError> {
        let app = self.router();

        tracing::info!(addr = %listener.local_addr()?, "Relay server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| ServerError::Server(e.to_string()))?;

        tracing::info!("Relay server stopped");
        Ok(())
    }
}

/// Routes of the relay, with permissive CORS for the management UI.
pub fn router(relay: RelayHandle) -> Router {
    Router::new()
        .route("/ws/video", get(video_ws_handler))
        .route("/ws/meta", get(meta_ws_handler))
        .route("/control", post(control_handler))
        .route("/refresh", post(refresh_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(relay)
}

async fn video_ws_handler(ws: WebSocketUpgrade, State(relay): State<RelayHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::serve_subscriber(socket, ChannelKind::Video, relay))
}

async fn meta_ws_handler(ws: WebSocketUpgrade, State(relay): State<RelayHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::serve_subscriber(socket, ChannelKind::Meta, relay))
}

#[derive(Debug, Default, Deserialize)]
struct ControlParams {
    action: Option<String>,
}

async fn control_handler(
    State(relay): State<RelayHandle>,
    Query(params): Query<ControlParams>,
) -> Json<ControlResponse> {
    let response = match params.action.as_deref() {
        Some(action) => relay.control.apply(action).await,
        None => ControlResponse {
            success: false,
            message: "video stream control failed: missing action".to_string(),
        },
    };
    Json(response)
}

async fn refresh_handler(State(relay): State<RelayHandle>) -> Json<ControlResponse> {
    Json(relay.control.refresh().await)
}

/// Per-channel section of `/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub active: usize,
    pub pending: usize,
    pub max_connections: usize,
    pub broadcasts: u64,
    pub last_broadcast_at: Option<DateTime<Utc>>,
}

impl ChannelStatus {
    fn collect(registry: &Registry, stats: &BroadcastStats) -> Self {
        Self {
            active: registry.active_len(),
            pending: registry.pending_len(),
            max_connections: registry.max_connections(),
            broadcasts: stats.broadcasts(),
            last_broadcast_at: stats.last_at(),
        }
    }
}

/// Body of `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub streaming: bool,
    pub source: SourceState,
    pub frames_captured: u64,
    pub video: ChannelStatus,
    pub meta: ChannelStatus,
}

async fn status_handler(State(relay): State<RelayHandle>) -> Json<StatusReport> {
    Json(StatusReport {
        streaming: relay.control.is_streaming(),
        source: relay.source_state(),
        frames_captured: relay.metrics.frames_captured(),
        video: ChannelStatus::collect(&relay.video, &relay.video_stats),
        meta: ChannelStatus::collect(&relay.meta, &relay.meta_stats),
    })
}

async fn metrics_handler(State(relay): State<RelayHandle>) -> impl IntoResponse {
    relay.metrics.update(&relay.snapshot());

    match relay.metrics.encode() {
        Ok(output) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

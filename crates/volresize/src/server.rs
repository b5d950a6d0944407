use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use volresize_controller::{encode_text, LeaderGate};

/// Diagnostics server configuration
#[derive(Clone)]
pub struct Config {
    /// Address to listen on
    pub listen_addr: SocketAddr,
    /// Path serving the metrics registry
    pub metrics_path: String,
}

struct DiagnosticsState {
    registry: Registry,
    gate: Arc<dyn LeaderGate>,
}

/// Health and metrics endpoints
pub struct DiagnosticsServer {
    config: Config,
    state: Arc<DiagnosticsState>,
}

impl DiagnosticsServer {
    pub fn new(config: Config, registry: Registry, gate: Arc<dyn LeaderGate>) -> Self {
        Self {
            config,
            state: Arc::new(DiagnosticsState { registry, gate }),
        }
    }

    fn build_router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/healthz/leader-election", get(leader_election_health))
            .route(&self.config.metrics_path, get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the listener; serving starts with [`serve`].
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.config.listen_addr).await
    }

    /// Serve until `token` is cancelled
    pub async fn serve(self, listener: TcpListener, token: CancellationToken) -> std::io::Result<()> {
        let app = self.build_router();
        info!(
            "Diagnostics server listening on {} (metrics at {})",
            listener.local_addr()?,
            self.config.metrics_path
        );
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn leader_election_health(State(state): State<Arc<DiagnosticsState>>) -> Response {
    if state.gate.healthy() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "leader lease renewal overdue").into_response()
    }
}

async fn metrics(State(state): State<Arc<DiagnosticsState>>) -> Response {
    match encode_text(&state.registry) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

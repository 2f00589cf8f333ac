//! Probe and metrics HTTP endpoints.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use snafu::{ResultExt, Snafu};
use tokio::{net::TcpListener, sync::watch};

/// A correlator loop that has not reported progress for this long is
/// considered stalled.
const STALL_THRESHOLD: Duration = Duration::from_secs(300);

type Result<T, E = HttpError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum HttpError {
    #[snafu(display("failed to bind {addr}"))]
    Bind {
        source: std::io::Error,
        addr: SocketAddr,
    },

    #[snafu(display("http server failed"))]
    Serve { source: std::io::Error },
}

#[derive(Clone)]
pub struct ProbeState {
    /// Flips to true once the initial discovery sync completed; never flips
    /// back.
    pub ready: watch::Receiver<bool>,
    /// Updated by the correlator on every loop iteration.
    pub heartbeat: watch::Receiver<Instant>,
}

async fn readyz(State(state): State<ProbeState>) -> impl IntoResponse {
    if *state.ready.borrow() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "initial sync in progress")
    }
}

async fn healthz(State(state): State<ProbeState>) -> impl IntoResponse {
    if state.heartbeat.borrow().elapsed() < STALL_THRESHOLD {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "correlator stalled")
    }
}

/// Binds an endpoint listener up front so that an unusable port is a fatal
/// startup error rather than a background task failure.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.context(BindSnafu { addr })
}

/// Serves `/healthz` and `/readyz` until shutdown.
pub async fn run_probe_server(
    listener: TcpListener,
    state: ProbeState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context(ServeSnafu)
}

async fn metrics(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &registry) {
        Ok(()) => (StatusCode::OK, body),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {error}"),
        ),
    }
}

/// Serves `/metrics` until shutdown.
pub async fn run_metrics_server(
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context(ServeSnafu)
}

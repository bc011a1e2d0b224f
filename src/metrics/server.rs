//! Prometheus exporter and health endpoint.

use axum::{Router, extract::State, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{MetricsError, PrometheusInitSnafu};

/// Install the global Prometheus recorder and serve it in the background.
///
/// Exposes `/metrics` (text format) and `/health` (always `ok`). The server
/// stops when `shutdown` is cancelled.
pub fn init(addr: SocketAddr, shutdown: CancellationToken) -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    tokio::spawn(serve(addr, handle, shutdown));
    Ok(())
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(|State(handle): State<PrometheusHandle>| async move { handle.render() }))
        .route("/health", get(|| async { "ok\n" }))
        .with_state(handle)
}

async fn serve(addr: SocketAddr, handle: PrometheusHandle, shutdown: CancellationToken) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };
    info!("Metrics endpoint listening on http://{}/metrics", addr);

    let result = axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;
    if let Err(e) = result {
        error!("Metrics server error: {}", e);
    }
}

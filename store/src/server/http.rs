//! HTTP server for the store node.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::signal;

use super::handlers::{
    AppState, handle_cluster_state, handle_healthy, handle_internal_query,
    handle_internal_stream, handle_metrics, handle_query, handle_ready, handle_replicate,
    handle_root, handle_stream,
};
use super::middleware::{MetricsLayer, TracingLayer};
use crate::error::{Error, Result};
use crate::gather::INTERNAL_QUERY_PATH;
use crate::multiplex::INTERNAL_STREAM_PATH;

/// Builds the node's router with every route and middleware.
///
/// `get` routes answer HEAD as well, which the query routes use for
/// stats-only queries.
pub fn build_router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    Router::new()
        .route("/", get(handle_root))
        .route("/query", get(handle_query))
        .route(INTERNAL_QUERY_PATH, get(handle_internal_query))
        .route("/stream", get(handle_stream))
        .route(INTERNAL_STREAM_PATH, get(handle_internal_stream))
        .route("/replicate", post(handle_replicate))
        .route("/_clusterstate", get(handle_cluster_state))
        .route("/metrics", get(handle_metrics))
        .route("/-/healthy", get(handle_healthy))
        .route("/-/ready", get(handle_ready))
        .layer(TracingLayer::new())
        .layer(MetricsLayer::new(metrics))
        .with_state(state)
}

/// HTTP server for the store node.
pub struct StoreServer {
    state: AppState,
    port: u16,
}

impl StoreServer {
    pub fn new(state: AppState, port: u16) -> Self {
        Self { state, port }
    }

    /// Run the HTTP server until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Io(format!("binding {}: {}", addr, e)))?;
        tracing::info!("Starting store HTTP server on {}", addr);

        serve(listener, self.state, shutdown_signal()).await?;

        tracing::info!("Server shut down gracefully");
        Ok(())
    }
}

/// Serves the node's API on `listener` until `shutdown` completes.
///
/// Live streams are ended when shutdown starts so that draining in-flight
/// requests can finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let streams = state.shutdown.clone();
    let shutdown = async move {
        shutdown.await;
        streams.cancel();
    };
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::from)
}

/// Listen for SIGTERM and SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}

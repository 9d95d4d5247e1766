//! HTTP route handlers for the store node.
//!
//! Client-facing routes (`/query`, `/stream`) coordinate across the cluster.
//! Their underscore-prefixed twins (`/_query`, `/_stream`) answer from this
//! node alone and are what the client-facing routes call on every peer.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, RawQuery, State};
use axum::http::{Method, StatusCode, Version, header};
use axum::response::{IntoResponse, Redirect, Response};
use futures::{StreamExt, TryStreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::error::ApiError;
use super::metrics::Metrics;
use super::response::{query_response, record_stream_response};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gather::QueryGatherer;
use crate::multiplex::{HttpStreamConnector, StreamMultiplexer};
use crate::peer::PeerDirectory;
use crate::query::{QueryParams, QueryRequest};
use crate::replicate::{ReplicateOutcome, replicate};
use crate::storage::LogStore;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LogStore>,
    pub peers: Arc<dyn PeerDirectory>,
    pub gatherer: QueryGatherer,
    pub multiplexer: StreamMultiplexer,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
    /// Cancelled when the server shuts down; ends every live stream.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wires the coordination services over `store` and `peers`.
    pub fn new(
        store: Arc<dyn LogStore>,
        peers: Arc<dyn PeerDirectory>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("building HTTP client: {}", e)))?;
        let gatherer = QueryGatherer::new(client.clone(), peers.clone(), config.query_timeout());
        let multiplexer = StreamMultiplexer::new(
            peers.clone(),
            Arc::new(HttpStreamConnector::new(client)),
            config.stream_refresh_interval(),
            config.stream_buffer,
        );
        Ok(Self {
            store,
            peers,
            gatherer,
            multiplexer,
            clock,
            metrics: Arc::new(Metrics::new()),
            shutdown: CancellationToken::new(),
        })
    }

    fn params(&self, request: QueryRequest) -> Result<QueryParams> {
        QueryParams::from_request(request, self.clock.as_ref())
    }
}

/// HTTP/1.0 clients cannot receive a chunked response.
fn ensure_streamable(version: Version) -> std::result::Result<(), ApiError> {
    if version == Version::HTTP_10 || version == Version::HTTP_09 {
        return Err(ApiError::new(
            StatusCode::PRECONDITION_FAILED,
            "can't stream to your client",
        ));
    }
    Ok(())
}

/// Handle GET /
pub async fn handle_root(RawQuery(query): RawQuery) -> Redirect {
    match query {
        Some(query) if !query.is_empty() => Redirect::temporary(&format!("/query?{}", query)),
        _ => Redirect::temporary("/query"),
    }
}

/// Handle GET and HEAD /query
///
/// Runs the query on every store node. HEAD returns statistics only. An empty
/// cluster is reported before the parameters are looked at.
pub async fn handle_query(
    State(state): State<AppState>,
    method: Method,
    request: std::result::Result<Query<QueryRequest>, QueryRejection>,
) -> std::result::Result<Response, ApiError> {
    let peers = state.gatherer.store_nodes()?;
    let Query(request) =
        request.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;
    let params = state.params(request)?;
    let result = state
        .gatherer
        .gather_from(peers, &params, method == Method::HEAD)
        .await?;
    query_response(&result)
}

/// Handle GET and HEAD /_query
pub async fn handle_internal_query(
    State(state): State<AppState>,
    method: Method,
    Query(request): Query<QueryRequest>,
) -> std::result::Result<Response, ApiError> {
    let start = Instant::now();
    let params = state.params(request)?;
    let mut result = state
        .store
        .query(&params, method == Method::HEAD)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    result.duration = format!("{:?}", start.elapsed());
    query_response(&result)
}

/// Handle GET /stream
///
/// Multiplexes the live streams of every store node until the client goes
/// away.
pub async fn handle_stream(
    State(state): State<AppState>,
    version: Version,
    Query(request): Query<QueryRequest>,
) -> std::result::Result<Response, ApiError> {
    let params = state.params(request)?;
    ensure_streamable(version)?;

    let cancel = state.shutdown.child_token();
    let records = state.multiplexer.run(params, cancel.clone());
    // Dropping the body, when the client disconnects, cancels the multiplexer.
    let guard = cancel.drop_guard();
    let records = ReceiverStream::new(records).map(move |record| {
        let _ = &guard;
        record
    });
    Ok(record_stream_response(records))
}

/// Handle GET /_stream
pub async fn handle_internal_stream(
    State(state): State<AppState>,
    version: Version,
    Query(request): Query<QueryRequest>,
) -> std::result::Result<Response, ApiError> {
    let params = state.params(request)?;
    ensure_streamable(version)?;
    let records = state
        .store
        .stream(&params)?
        .take_until(state.shutdown.clone().cancelled_owned());
    Ok(record_stream_response(records))
}

/// Handle POST /replicate
///
/// Commits the pushed records as one segment.
pub async fn handle_replicate(
    State(state): State<AppState>,
    body: Body,
) -> std::result::Result<&'static str, ApiError> {
    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    match replicate(state.store.as_ref(), reader).await? {
        ReplicateOutcome::Committed(replicated) => {
            state.metrics.replicated_segments_total.inc();
            state
                .metrics
                .replicated_records_total
                .inc_by(replicated.records);
            state.metrics.replicated_bytes_total.inc_by(replicated.bytes);
            Ok("OK\n")
        }
        ReplicateOutcome::NoRecords => Ok("No records\n"),
    }
}

/// Handle GET /_clusterstate
pub async fn handle_cluster_state(
    State(state): State<AppState>,
) -> std::result::Result<Response, ApiError> {
    let body = serde_json::to_string_pretty(&state.peers.state())
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body,
    )
        .into_response())
}

/// Handle GET /metrics
pub async fn handle_metrics(State(state): State<AppState>) -> String {
    state.metrics.encode()
}

/// Handle GET /-/healthy
pub async fn handle_healthy() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK\n")
}

/// Handle GET /-/ready
pub async fn handle_ready() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK\n")
}

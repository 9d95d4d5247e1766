//! Integration tests for the store node's HTTP routes.
//!
//! Requests go through the full router, middleware included, with
//! `tower::ServiceExt::oneshot`; nothing listens on a socket.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, Version, header};
use bytes::Bytes;
use chrono::{TimeDelta, TimeZone, Utc};
use store::clock::MockClock;
use store::config::{Config, StorageConfig};
use store::peer::{Peer, PeerDirectory, PeerType, StaticPeers};
use store::server::{AppState, build_router};
use store::storage::MemoryLog;
use store::{Error, Record, RecordId};
use tower::ServiceExt;

const WINDOW: &str = "from=2024-01-20T10:00:00Z&to=2024-01-20T11:00:00Z";

fn record(offset_secs: i64, payload: &str) -> Record {
    let base = Utc.with_ymd_and_hms(2024, 1, 20, 10, 0, 0).unwrap();
    Record::new(RecordId::at(base + TimeDelta::seconds(offset_secs)), payload)
}

fn batch(records: &[Record]) -> Vec<u8> {
    let mut body = Vec::new();
    for record in records {
        body.extend_from_slice(&record.line);
        body.push(b'\n');
    }
    body
}

/// Membership that never has any store nodes.
struct NoPeers;

impl PeerDirectory for NoPeers {
    fn current(&self, _role: PeerType) -> Vec<String> {
        Vec::new()
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "members": [] })
    }
}

fn setup_with_peers(peers: Arc<dyn PeerDirectory>) -> (Router, AppState, Arc<MemoryLog>) {
    let log = Arc::new(MemoryLog::new());
    let config = Config {
        storage: StorageConfig::InMemory,
        ..Default::default()
    };
    let clock = Arc::new(MockClock::with_time(
        Utc.with_ymd_and_hms(2024, 1, 20, 12, 0, 0).unwrap(),
    ));
    let state = AppState::new(log.clone(), peers, clock, &config).unwrap();
    (build_router(state.clone()), state, log)
}

fn setup() -> (Router, AppState, Arc<MemoryLog>) {
    let peers = Arc::new(StaticPeers::new(
        Peer::new("127.0.0.1:7650", PeerType::Store),
        vec![Peer::new("127.0.0.1:7651", PeerType::Ingest)],
    ));
    setup_with_peers(peers)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn replicate_request(body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/replicate")
        .body(Body::from(body))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

#[tokio::test]
async fn should_commit_replicated_batch() {
    // given
    let (app, state, log) = setup();
    let records = vec![record(20, "GET /b 500"), record(10, "GET /a 200")];

    // when
    let response = app.oneshot(replicate_request(batch(&records))).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, Bytes::from("OK\n"));
    assert_eq!(log.segments().await, vec![(records[1].id, records[0].id, 2)]);
    let metrics = state.metrics.encode();
    assert!(metrics.contains("store_replicated_segments_total 1"));
    assert!(metrics.contains("store_replicated_records_total 2"));
}

#[tokio::test]
async fn should_answer_no_records_for_empty_push() {
    // given
    let (app, state, log) = setup();

    // when
    let response = app.oneshot(replicate_request(Vec::new())).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, Bytes::from("No records\n"));
    assert_eq!(log.segment_count().await, 0);
    assert!(state.metrics.encode().contains("store_replicated_segments_total 0"));
}

#[tokio::test]
async fn should_reject_malformed_push_without_committing() {
    // given
    let (app, _state, log) = setup();
    let mut body = batch(&[record(10, "fine")]);
    body.extend_from_slice(b"this is not a record\n");

    // when
    let response = app.oneshot(replicate_request(body)).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(log.segment_count().await, 0);
}

#[tokio::test]
async fn should_answer_internal_query_from_local_store() {
    // given
    let (app, _state, _log) = setup();
    let records = vec![record(10, "GET /a 200"), record(20, "GET /b 500")];
    app.clone()
        .oneshot(replicate_request(batch(&records)))
        .await
        .unwrap();

    // when
    let response = app
        .oneshot(get(&format!("/_query?{}&q=500", WINDOW)))
        .await
        .unwrap();

    // then
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-store-nodes-queried"], "1");
    assert_eq!(response.headers()["x-store-segments-queried"], "1");
    assert_eq!(response.headers()["x-store-q"], "500");
    assert!(response.headers().contains_key("x-store-duration"));
    let mut expected = records[1].line.to_vec();
    expected.push(b'\n');
    assert_eq!(body_bytes(response).await, Bytes::from(expected));
}

#[tokio::test]
async fn should_answer_head_internal_query_with_stats_only() {
    // given
    let (app, _state, _log) = setup();
    app.clone()
        .oneshot(replicate_request(batch(&[record(10, "x"), record(11, "y")])))
        .await
        .unwrap();

    // when
    let request = Request::builder()
        .method(Method::HEAD)
        .uri(format!("/_query?{}", WINDOW))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-store-segments-queried"], "1");
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn should_reject_invalid_query_params() {
    // given
    let (app, _state, _log) = setup();

    // when
    let response = app.oneshot(get("/_query?from=yesterday")).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_bytes(response).await;
    assert!(String::from_utf8_lossy(&body).contains("invalid from"));
}

#[tokio::test]
async fn should_reject_query_without_store_nodes() {
    // given
    let (app, _state, _log) = setup_with_peers(Arc::new(NoPeers));

    // when
    let response = app.oneshot(get(&format!("/query?{}", WINDOW))).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn should_report_empty_cluster_before_checking_params() {
    // given
    let (app, _state, _log) = setup_with_peers(Arc::new(NoPeers));

    // when
    let response = app.oneshot(get("/query?from=yesterday")).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn should_reject_invalid_client_query_params() {
    // given
    let (app, _state, _log) = setup();

    // when
    let malformed = app.clone().oneshot(get("/query?regex=maybe")).await.unwrap();
    let invalid = app.oneshot(get("/query?from=yesterday")).await.unwrap();

    // then
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn should_redirect_root_to_query() {
    // given
    let (app, _state, _log) = setup();

    // when
    let response = app.oneshot(get("/?q=error&regex=true")).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()[header::LOCATION],
        "/query?q=error&regex=true"
    );
}

#[tokio::test]
async fn should_render_cluster_state_as_json() {
    // given
    let (app, _state, _log) = setup();

    // when
    let response = app.oneshot(get("/_clusterstate")).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json; charset=utf-8"
    );
    let body = body_bytes(response).await;
    let state: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(state["local"]["addr"], "127.0.0.1:7650");
    assert_eq!(state["members"].as_array().unwrap().len(), 2);
    assert!(String::from_utf8_lossy(&body).contains('\n'));
}

#[tokio::test]
async fn should_refuse_streaming_to_http_1_0_client() {
    // given
    let (app, _state, _log) = setup();
    let request = Request::builder()
        .uri("/_stream")
        .version(Version::HTTP_10)
        .body(Body::empty())
        .unwrap();

    // when
    let response = app.oneshot(request).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(
        body_bytes(response).await,
        Bytes::from("can't stream to your client\n")
    );
}

#[tokio::test]
async fn should_validate_stream_params_before_client_version() {
    // given
    let (app, _state, _log) = setup();
    let request = Request::builder()
        .uri("/stream?q=(&regex=true")
        .version(Version::HTTP_10)
        .body(Body::empty())
        .unwrap();

    // when
    let response = app.oneshot(request).await.unwrap();

    // then
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn should_record_one_latency_sample_per_request() {
    // given
    let (app, state, _log) = setup();

    // when
    app.clone()
        .oneshot(get("/_query?from=yesterday"))
        .await
        .unwrap();
    app.oneshot(get(&format!("/_query?{}", WINDOW))).await.unwrap();

    // then
    let metrics = state.metrics.encode();
    assert!(metrics.contains(
        r#"http_request_duration_seconds_count{method="Get",endpoint="/_query",status="400"} 1"#
    ));
    assert!(metrics.contains(
        r#"http_request_duration_seconds_count{method="Get",endpoint="/_query",status="200"} 1"#
    ));
    assert!(metrics.contains(
        r#"http_requests_total{method="Get",endpoint="/_query",status="400"} 1"#
    ));
}

#[tokio::test]
async fn should_expose_metrics_and_health() {
    // given
    let (app, _state, _log) = setup();

    // when
    let metrics = app.clone().oneshot(get("/metrics")).await.unwrap();
    let healthy = app.clone().oneshot(get("/-/healthy")).await.unwrap();
    let ready = app.oneshot(get("/-/ready")).await.unwrap();

    // then
    assert_eq!(metrics.status(), StatusCode::OK);
    assert!(
        String::from_utf8_lossy(&body_bytes(metrics).await)
            .contains("# HELP http_request_duration_seconds")
    );
    assert_eq!(healthy.status(), StatusCode::OK);
    assert_eq!(ready.status(), StatusCode::OK);
}

#[test]
fn should_refuse_state_with_zero_refresh_interval() {
    // given
    let config = Config {
        storage: StorageConfig::InMemory,
        stream_refresh_interval_ms: 0,
        ..Default::default()
    };
    let peers = Arc::new(StaticPeers::new(
        Peer::new("127.0.0.1:7650", PeerType::Store),
        vec![],
    ));

    // when
    let state = AppState::new(
        Arc::new(MemoryLog::new()),
        peers,
        Arc::new(MockClock::new()),
        &config,
    );

    // then
    assert!(matches!(state, Err(Error::InvalidInput(_))));
}

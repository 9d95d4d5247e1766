//! Multi-node tests: several store nodes on ephemeral ports sharing one
//! membership list, talking to each other over real HTTP.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rstest::rstest;
use store::clock::SystemClock;
use store::config::{Config, StorageConfig};
use store::peer::{Peer, PeerType, StaticPeers};
use store::server::{AppState, serve};
use store::storage::MemoryLog;
use store::{Record, RecordId};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct Node {
    addr: String,
    log: Arc<MemoryLog>,
}

struct Cluster {
    nodes: Vec<Node>,
    peers: Arc<StaticPeers>,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl Cluster {
    async fn start(size: usize) -> Self {
        let mut listeners = Vec::new();
        for _ in 0..size {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let addrs: Vec<String> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap().to_string())
            .collect();
        let peers = Arc::new(StaticPeers::new(
            Peer::new(addrs[0].clone(), PeerType::Store),
            addrs[1..].iter().map(|a| Peer::new(a.clone(), PeerType::Store)),
        ));
        let config = Config {
            storage: StorageConfig::InMemory,
            query_timeout_ms: 2_000,
            stream_refresh_interval_ms: 50,
            ..Default::default()
        };

        let shutdown = CancellationToken::new();
        let mut nodes = Vec::new();
        for (listener, addr) in listeners.into_iter().zip(addrs) {
            let log = Arc::new(MemoryLog::new());
            let state =
                AppState::new(log.clone(), peers.clone(), Arc::new(SystemClock), &config).unwrap();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                serve(listener, state, async move { stop.cancelled().await })
                    .await
                    .unwrap()
            });
            nodes.push(Node { addr, log });
        }

        Self {
            nodes,
            peers,
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    fn url(&self, node: usize, path: &str) -> String {
        format!("http://{}{}", self.nodes[node].addr, path)
    }

    async fn replicate(&self, node: usize, records: &[Record]) -> String {
        let mut body = Vec::new();
        for record in records {
            body.extend_from_slice(&record.line);
            body.push(b'\n');
        }
        self.client
            .post(self.url(node, "/replicate"))
            .body(body)
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn record(payload: &str) -> Record {
    Record::new(RecordId::new(), payload)
}

fn header(response: &reqwest::Response, name: &str) -> String {
    response.headers()[name].to_str().unwrap().to_string()
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn should_merge_records_from_every_node() {
    // given
    let cluster = Cluster::start(3).await;
    let shared = record("replicated to two nodes");
    let a = record("only on node 0");
    let b = record("only on node 2");
    assert_eq!(cluster.replicate(0, &[a.clone(), shared.clone()]).await, "OK\n");
    assert_eq!(cluster.replicate(1, &[shared.clone()]).await, "OK\n");
    assert_eq!(cluster.replicate(2, &[b.clone()]).await, "OK\n");

    // when
    let response = cluster
        .client
        .get(cluster.url(1, "/query"))
        .send()
        .await
        .unwrap();

    // then
    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "x-store-nodes-queried"), "3");
    assert_eq!(header(&response, "x-store-segments-queried"), "3");
    assert_eq!(header(&response, "x-store-error-count"), "0");
    let body = response.bytes().await.unwrap();
    let mut expected = vec![a.line, shared.line, b.line];
    expected.sort();
    let lines: Vec<Bytes> = body
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty())
        .map(|l| body.slice_ref(l))
        .collect();
    assert_eq!(lines, expected);
}

#[rstest]
#[case::leading_space(" 500", true)]
#[case::trailing_space("GET ", true)]
#[case::control_character("a\nb", false)]
#[tokio::test]
async fn should_keep_expression_intact_across_nodes(#[case] q: &str, #[case] matches: bool) {
    // given
    let cluster = Cluster::start(2).await;
    let hit = record("GET /a 500");
    cluster.replicate(0, &[hit.clone()]).await;
    cluster.replicate(1, &[record("POST/b")]).await;

    // when
    let response = cluster
        .client
        .get(cluster.url(1, "/query"))
        .query(&[("q", q)])
        .send()
        .await
        .unwrap();

    // then
    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "x-store-error-count"), "0");
    assert_eq!(header(&response, "x-store-nodes-queried"), "2");
    let body = response.bytes().await.unwrap();
    let mut expected = Vec::new();
    if matches {
        expected.extend_from_slice(&hit.line);
        expected.push(b'\n');
    }
    assert_eq!(&body[..], &expected[..]);
}

#[tokio::test]
async fn should_count_unreachable_node_as_error() {
    // given
    let cluster = Cluster::start(2).await;
    cluster.replicate(0, &[record("x")]).await;
    cluster.replicate(1, &[record("y")]).await;
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap().to_string();
    drop(dead);
    cluster.peers.join(Peer::new(dead_addr, PeerType::Store));

    // when
    let response = cluster
        .client
        .get(cluster.url(0, "/query"))
        .send()
        .await
        .unwrap();

    // then
    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "x-store-nodes-queried"), "2");
    assert_eq!(header(&response, "x-store-error-count"), "1");
}

#[tokio::test]
async fn should_answer_head_query_with_stats_only() {
    // given
    let cluster = Cluster::start(2).await;
    cluster.replicate(0, &[record("x"), record("y")]).await;
    cluster.replicate(1, &[record("z")]).await;

    // when
    let response = cluster
        .client
        .head(cluster.url(0, "/query"))
        .send()
        .await
        .unwrap();

    // then
    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "x-store-segments-queried"), "2");
    assert!(header(&response, "x-store-max-data-set-size").parse::<u64>().unwrap() > 0);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn should_stream_records_committed_on_any_node() {
    // given
    let cluster = Cluster::start(2).await;
    let response = cluster
        .client
        .get(cluster.url(0, "/stream?q=live"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let mut body = response.bytes_stream();
    eventually("sub-streams opened", || {
        cluster.nodes.iter().all(|n| n.log.live_streams() == 1)
    })
    .await;

    // when
    let pushed = record("live from node 1");
    cluster.replicate(1, &[pushed.clone(), record("not matching")]).await;

    // then
    let mut buffer = BytesMut::new();
    while !buffer.contains(&b'\n') {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("no record streamed")
            .expect("stream ended")
            .unwrap();
        buffer.extend_from_slice(&chunk);
    }
    let mut expected = pushed.line.to_vec();
    expected.push(b'\n');
    assert_eq!(&buffer[..], &expected[..]);
}

#[tokio::test]
async fn should_close_sub_streams_when_client_disconnects() {
    // given
    let cluster = Cluster::start(3).await;
    let response = cluster
        .client
        .get(cluster.url(2, "/stream"))
        .send()
        .await
        .unwrap();
    eventually("sub-streams opened", || {
        cluster.nodes.iter().all(|n| n.log.live_streams() == 1)
    })
    .await;

    // when
    drop(response);

    // then
    eventually("sub-streams closed", || {
        cluster.nodes.iter().all(|n| n.log.live_streams() == 0)
    })
    .await;
}

#[tokio::test]
async fn should_expose_membership() {
    // given
    let cluster = Cluster::start(2).await;

    // when
    let body = cluster
        .client
        .get(cluster.url(1, "/_clusterstate"))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    // then
    let state: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(state["members"].as_array().unwrap().len(), 2);
}

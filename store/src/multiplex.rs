//! Live stream multiplexing.
//!
//! A client stream is fed by one sub-stream per store node. A supervising
//! task re-reads membership on every refresh tick, opens sub-streams to new
//! nodes, closes those of departed nodes and reopens any that ended. Every
//! sub-stream forwards records into one bounded channel as they arrive; there
//! is no ordering across nodes.
//!
//! Everything hangs off one [`CancellationToken`]. Cancelling it, or dropping
//! the receiving end of the channel, stops the supervisor and every
//! sub-stream.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::SplitStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::peer::{PeerDirectory, PeerType};
use crate::query::QueryParams;

/// Path of the single-node stream endpoint.
pub const INTERNAL_STREAM_PATH: &str = "/_stream";

/// Opens a record stream to one node.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connects to the node at `addr`. The returned stream yields one record
    /// per item, without the trailing newline.
    async fn connect(
        &self,
        addr: &str,
        params: &QueryParams,
    ) -> Result<BoxStream<'static, Result<Bytes>>>;
}

/// Connects to a node's internal stream endpoint over HTTP.
#[derive(Clone)]
pub struct HttpStreamConnector {
    client: reqwest::Client,
}

impl HttpStreamConnector {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StreamConnector for HttpStreamConnector {
    async fn connect(
        &self,
        addr: &str,
        params: &QueryParams,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let response = self
            .client
            .get(format!("http://{}{}", addr, INTERNAL_STREAM_PATH))
            .query(&params.to_request())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("{} from {}", status.as_u16(), addr)));
        }

        let reader = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
        let lines = SplitStream::new(reader.split(b'\n')).filter_map(|line| {
            futures::future::ready(match line {
                Ok(line) if line.is_empty() => None,
                Ok(line) => Some(Ok(Bytes::from(line))),
                Err(e) => Some(Err(Error::from(e))),
            })
        });
        Ok(lines.boxed())
    }
}

/// Builds multiplexed streams over the current store nodes.
#[derive(Clone)]
pub struct StreamMultiplexer {
    peers: Arc<dyn PeerDirectory>,
    connector: Arc<dyn StreamConnector>,
    refresh: Duration,
    buffer: usize,
}

impl StreamMultiplexer {
    pub fn new(
        peers: Arc<dyn PeerDirectory>,
        connector: Arc<dyn StreamConnector>,
        refresh: Duration,
        buffer: usize,
    ) -> Self {
        Self {
            peers,
            connector,
            refresh,
            buffer: buffer.max(1),
        }
    }

    /// Starts a multiplexed stream for `params` and returns its output.
    ///
    /// The stream never ends on its own; it runs until `cancel` fires or the
    /// receiver is dropped.
    pub fn run(&self, params: QueryParams, cancel: CancellationToken) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let supervisor = Supervisor {
            peers: self.peers.clone(),
            connector: self.connector.clone(),
            params: Arc::new(params),
            tx,
            cancel,
            streams: HashMap::new(),
        };
        tokio::spawn(supervisor.run(self.refresh));
        rx
    }
}

struct SubStream {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Supervisor {
    peers: Arc<dyn PeerDirectory>,
    connector: Arc<dyn StreamConnector>,
    params: Arc<QueryParams>,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    streams: HashMap<String, SubStream>,
}

impl Supervisor {
    async fn run(mut self, refresh: Duration) {
        let mut ticker = tokio::time::interval(refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.tx.closed() => break,
                _ = ticker.tick() => self.reconcile(),
            }
        }

        for (_, sub) in self.streams.drain() {
            sub.cancel.cancel();
            let _ = sub.handle.await;
        }
        tracing::debug!("stream supervisor stopped");
    }

    fn reconcile(&mut self) {
        let current: HashSet<String> = self.peers.current(PeerType::Store).into_iter().collect();

        let mut reaped = HashSet::new();
        self.streams.retain(|addr, sub| {
            if sub.handle.is_finished() {
                reaped.insert(addr.clone());
                return false;
            }
            if !current.contains(addr) {
                tracing::debug!(peer = %addr, "closing sub-stream of departed peer");
                sub.cancel.cancel();
                return false;
            }
            true
        });

        for addr in current {
            if self.streams.contains_key(&addr) || reaped.contains(&addr) {
                continue;
            }
            let cancel = self.cancel.child_token();
            let handle = tokio::spawn(forward(
                addr.clone(),
                self.connector.clone(),
                self.params.clone(),
                self.tx.clone(),
                cancel.clone(),
            ));
            self.streams.insert(addr, SubStream { cancel, handle });
        }
    }
}

/// Relays one node's records into the shared channel until the node's
/// stream ends or the sub-stream is cancelled.
async fn forward(
    addr: String,
    connector: Arc<dyn StreamConnector>,
    params: Arc<QueryParams>,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        connected = connector.connect(&addr, &params) => connected,
    };
    let mut records = match connected {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(peer = %addr, error = %e, "failed to open sub-stream");
            return;
        }
    };
    tracing::debug!(peer = %addr, "sub-stream opened");

    loop {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = records.next() => match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    tracing::warn!(peer = %addr, error = %e, "sub-stream failed");
                    return;
                }
                None => {
                    tracing::debug!(peer = %addr, "sub-stream ended");
                    return;
                }
            },
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = tx.send(record) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

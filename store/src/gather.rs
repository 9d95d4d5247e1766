//! Scatter-gather query coordination.
//!
//! A client query is answered by sending the same internal query to every
//! store node, this one included, and merging what comes back. Peers that
//! cannot answer are counted in the result's `error_count`; they never fail
//! the query as a whole.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Method, RequestBuilder};
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::peer::{PeerDirectory, PeerType};
use crate::query::{QueryParams, QueryResult};

/// Path of the single-node query endpoint.
pub const INTERNAL_QUERY_PATH: &str = "/_query";

/// Fans queries out to every store node and merges the answers.
#[derive(Clone)]
pub struct QueryGatherer {
    client: reqwest::Client,
    peers: Arc<dyn PeerDirectory>,
    timeout: Duration,
}

impl QueryGatherer {
    pub fn new(client: reqwest::Client, peers: Arc<dyn PeerDirectory>, timeout: Duration) -> Self {
        Self {
            client,
            peers,
            timeout,
        }
    }

    /// Runs `params` on every current store node.
    ///
    /// Fails with [`Error::Unavailable`] when there are no store nodes, and
    /// with [`Error::Merge`] if two answers cannot be combined. Dropping the
    /// returned future aborts every request still in flight.
    pub async fn gather(&self, params: &QueryParams, stats_only: bool) -> Result<QueryResult> {
        let peers = self.store_nodes()?;
        self.gather_from(peers, params, stats_only).await
    }

    /// Snapshots the current store nodes; an empty cluster is unavailable.
    pub fn store_nodes(&self) -> Result<Vec<String>> {
        let peers = self.peers.current(PeerType::Store);
        if peers.is_empty() {
            return Err(Error::Unavailable("no store nodes available".to_string()));
        }
        Ok(peers)
    }

    /// Runs `params` on the given store nodes, as [`QueryGatherer::gather`].
    pub async fn gather_from(
        &self,
        peers: Vec<String>,
        params: &QueryParams,
        stats_only: bool,
    ) -> Result<QueryResult> {
        let start = Instant::now();
        let method = if stats_only { Method::HEAD } else { Method::GET };
        let request = params.to_request();
        let mut tasks = JoinSet::new();
        for peer in peers {
            let builder = self
                .client
                .request(method.clone(), format!("http://{}{}", peer, INTERNAL_QUERY_PATH))
                .query(&request)
                .timeout(self.timeout);
            tasks.spawn(async move {
                let outcome = fetch(builder).await;
                (peer, outcome)
            });
        }

        let mut result = QueryResult::new(params.clone());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(partial))) => result.merge(partial)?,
                Ok((peer, Err(e))) => {
                    tracing::warn!(peer = %peer, error = %e, "internal query failed");
                    result.error_count += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "internal query task failed");
                    result.error_count += 1;
                }
            }
        }

        result.duration = format!("{:?}", start.elapsed());
        Ok(result)
    }
}

async fn fetch(builder: RequestBuilder) -> Result<QueryResult> {
    let response = builder.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let body = body.trim();
        let reason = if body.is_empty() { "unknown" } else { body };
        return Err(Error::Transport(format!("{}: {}", status.as_u16(), reason)));
    }
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    QueryResult::decode(&headers, body)
}

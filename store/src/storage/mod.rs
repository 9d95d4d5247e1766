//! Local log storage.
//!
//! The coordination layer talks to the local store only through [`LogStore`]
//! and [`WriteSegment`]. Two engines implement them: [`MemoryLog`] keeps
//! everything in memory, [`FileLog`] keeps one file per segment on disk.
//!
//! # Segment lifecycle
//!
//! ```text
//!   create() ──> Open ──close(low, high)──> Committed (visible, immutable)
//!                  │
//!                  └────delete()──────────> Discarded (no trace)
//! ```
//!
//! Open segments are owned by exactly one task and are never visible to
//! queries or streams.

mod file;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

pub use file::FileLog;
pub use memory::MemoryLog;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::model::{Record, RecordId};
use crate::query::{QueryParams, QueryResult, RecordMatcher};

/// Number of committed records buffered for live streams before slow
/// subscribers start missing records.
const FEED_CAPACITY: usize = 4096;

/// Operations the node needs from its local store.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Runs a query against committed segments.
    ///
    /// With `stats_only` the result carries statistics but no records.
    async fn query(&self, params: &QueryParams, stats_only: bool) -> Result<QueryResult>;

    /// Returns a live stream of matching records from segments committed
    /// after the call. The stream ends only when dropped.
    fn stream(&self, params: &QueryParams) -> Result<BoxStream<'static, Bytes>>;

    /// Creates a new open segment.
    async fn create(&self) -> Result<Box<dyn WriteSegment>>;
}

/// A segment being written.
#[async_trait]
pub trait WriteSegment: Send {
    /// Appends one record.
    async fn write(&mut self, record: &Record) -> Result<()>;

    /// Commits the segment with the given watermarks, making it visible.
    async fn close(&mut self, low: RecordId, high: RecordId) -> Result<()>;

    /// Discards the segment and everything written to it.
    async fn delete(&mut self) -> Result<()>;
}

/// Opens the store described by `config`.
pub async fn create_store(config: &StorageConfig) -> Result<Arc<dyn LogStore>> {
    match config {
        StorageConfig::InMemory => Ok(Arc::new(MemoryLog::new())),
        StorageConfig::File(file) => Ok(Arc::new(FileLog::open(&file.path).await?)),
    }
}

/// Fan-out of newly committed records to live streams.
#[derive(Clone)]
pub(crate) struct RecordFeed {
    tx: broadcast::Sender<Record>,
}

impl RecordFeed {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    /// Returns true if any live stream is listening.
    pub(crate) fn has_subscribers(&self) -> bool {
        self.subscribers() > 0
    }

    pub(crate) fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publishes the records of a just-committed segment.
    pub(crate) fn publish(&self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            // Err only means nobody is listening.
            if self.tx.send(record).is_err() {
                return;
            }
        }
    }

    /// Subscribes to records matching `matcher`.
    pub(crate) fn subscribe(&self, matcher: RecordMatcher) -> BoxStream<'static, Bytes> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(move |item| {
                let line = match item {
                    Ok(record) => matcher.matches(&record).then_some(record.line),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "live stream fell behind, records skipped");
                        None
                    }
                };
                futures::future::ready(line)
            })
            .boxed()
    }
}

/// Shared query evaluation over a segment's records.
///
/// Returns the records inside the query window that match, in key order.
pub(crate) fn select_records<'a>(
    params: &QueryParams,
    matcher: &RecordMatcher,
    records: impl IntoIterator<Item = &'a Record>,
) -> Vec<Bytes> {
    records
        .into_iter()
        .filter(|r| params.covers(r) && matcher.matches(r))
        .map(|r| r.line.clone())
        .collect()
}

//! In-memory log store.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::RwLock;

use super::{LogStore, RecordFeed, WriteSegment, select_records};
use crate::error::{Error, Result};
use crate::model::{Record, RecordId};
use crate::query::{QueryParams, QueryResult};

#[derive(Debug)]
struct CommittedSegment {
    low: RecordId,
    high: RecordId,
    size: u64,
    records: Vec<Record>,
}

/// A log store that keeps every committed segment in memory.
///
/// Data does not survive a restart. Useful for tests and for nodes that only
/// serve as short-lived replicas.
pub struct MemoryLog {
    segments: Arc<RwLock<Vec<CommittedSegment>>>,
    feed: RecordFeed,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            segments: Arc::new(RwLock::new(Vec::new())),
            feed: RecordFeed::new(),
        }
    }

    /// Returns the number of committed segments.
    pub async fn segment_count(&self) -> usize {
        self.segments.read().await.len()
    }

    /// Returns the watermarks and record count of every committed segment.
    pub async fn segments(&self) -> Vec<(RecordId, RecordId, usize)> {
        self.segments
            .read()
            .await
            .iter()
            .map(|s| (s.low, s.high, s.records.len()))
            .collect()
    }

    /// Returns the number of open live streams.
    pub fn live_streams(&self) -> usize {
        self.feed.subscribers()
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryLog {
    async fn query(&self, params: &QueryParams, stats_only: bool) -> Result<QueryResult> {
        let matcher = params.matcher()?;
        let mut result = QueryResult::new(params.clone());
        result.nodes_queried = 1;

        let segments = self.segments.read().await;
        for segment in segments
            .iter()
            .filter(|s| params.overlaps(s.low, s.high))
        {
            result.segments_queried += 1;
            result.max_data_set_size += segment.size;
            if !stats_only {
                result
                    .records
                    .extend(select_records(params, &matcher, &segment.records));
            }
        }
        result.records.sort();
        Ok(result)
    }

    fn stream(&self, params: &QueryParams) -> Result<BoxStream<'static, Bytes>> {
        Ok(self.feed.subscribe(params.matcher()?))
    }

    async fn create(&self) -> Result<Box<dyn WriteSegment>> {
        Ok(Box::new(MemorySegment {
            segments: self.segments.clone(),
            feed: self.feed.clone(),
            records: Vec::new(),
            size: 0,
            done: false,
        }))
    }
}

struct MemorySegment {
    segments: Arc<RwLock<Vec<CommittedSegment>>>,
    feed: RecordFeed,
    records: Vec<Record>,
    size: u64,
    done: bool,
}

impl MemorySegment {
    fn ensure_open(&self) -> Result<()> {
        if self.done {
            return Err(Error::Storage("segment is no longer open".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WriteSegment for MemorySegment {
    async fn write(&mut self, record: &Record) -> Result<()> {
        self.ensure_open()?;
        self.size += record.line.len() as u64 + 1;
        self.records.push(record.clone());
        Ok(())
    }

    async fn close(&mut self, low: RecordId, high: RecordId) -> Result<()> {
        self.ensure_open()?;
        self.done = true;
        let records = std::mem::take(&mut self.records);
        let live = self.feed.has_subscribers().then(|| records.clone());
        self.segments.write().await.push(CommittedSegment {
            low,
            high,
            size: self.size,
            records,
        });
        if let Some(live) = live {
            self.feed.publish(live);
        }
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.done = true;
        self.records.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::storage::test_utils::{commit, hour_query, record_at};

    #[tokio::test]
    async fn should_query_committed_segment() {
        // given
        let log = MemoryLog::new();
        let records = vec![record_at(10, "GET /a 200"), record_at(20, "GET /b 500")];
        commit(&log, &records).await;

        // when
        let result = log.query(&hour_query(""), false).await.unwrap();

        // then
        assert_eq!(result.nodes_queried, 1);
        assert_eq!(result.segments_queried, 1);
        assert_eq!(
            result.max_data_set_size,
            records.iter().map(|r| r.line.len() as u64 + 1).sum::<u64>()
        );
        assert_eq!(
            result.records,
            vec![records[0].line.clone(), records[1].line.clone()]
        );
    }

    #[tokio::test]
    async fn should_filter_by_expression_and_window() {
        // given
        let log = MemoryLog::new();
        let records = vec![
            record_at(-10, "GET /early 500"),
            record_at(10, "GET /a 200"),
            record_at(20, "GET /b 500"),
        ];
        commit(&log, &records).await;

        // when
        let result = log.query(&hour_query("500"), false).await.unwrap();

        // then
        assert_eq!(result.records, vec![records[2].line.clone()]);
    }

    #[tokio::test]
    async fn should_omit_records_for_stats_only() {
        // given
        let log = MemoryLog::new();
        commit(&log, &[record_at(10, "x")]).await;

        // when
        let result = log.query(&hour_query(""), true).await.unwrap();

        // then
        assert_eq!(result.segments_queried, 1);
        assert!(result.records.is_empty());
    }

    #[tokio::test]
    async fn should_skip_segments_outside_window() {
        // given
        let log = MemoryLog::new();
        commit(&log, &[record_at(-7200, "old")]).await;
        commit(&log, &[record_at(60, "new")]).await;

        // when
        let result = log.query(&hour_query(""), true).await.unwrap();

        // then
        assert_eq!(result.segments_queried, 1);
    }

    #[tokio::test]
    async fn should_not_expose_open_or_deleted_segments() {
        // given
        let log = MemoryLog::new();
        let mut open = log.create().await.unwrap();
        open.write(&record_at(10, "open")).await.unwrap();
        let mut deleted = log.create().await.unwrap();
        deleted.write(&record_at(20, "deleted")).await.unwrap();

        // when
        deleted.delete().await.unwrap();
        let result = log.query(&hour_query(""), false).await.unwrap();

        // then
        assert_eq!(result.segments_queried, 0);
        assert!(result.records.is_empty());
        assert_eq!(log.segment_count().await, 0);
    }

    #[tokio::test]
    async fn should_reject_writes_after_close() {
        // given
        let log = MemoryLog::new();
        let record = record_at(10, "x");
        let mut segment = log.create().await.unwrap();
        segment.write(&record).await.unwrap();
        segment.close(record.id, record.id).await.unwrap();

        // when
        let result = segment.write(&record).await;

        // then
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(segment.delete().await.is_err());
    }

    #[tokio::test]
    async fn should_stream_matching_records_committed_after_subscribe() {
        // given
        let log = MemoryLog::new();
        commit(&log, &[record_at(1, "before subscribe 500")]).await;
        let mut stream = log.stream(&hour_query("500")).unwrap();

        // when
        let records = vec![record_at(10, "GET /a 200"), record_at(20, "GET /b 500")];
        commit(&log, &records).await;

        // then
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert_eq!(next, Some(records[1].line.clone()));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stream.next())
                .await
                .is_err()
        );
        assert_eq!(log.live_streams(), 1);
        drop(stream);
        assert_eq!(log.live_streams(), 0);
    }
}

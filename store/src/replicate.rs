//! Replication ingestion.
//!
//! A peer pushes a batch of newline-delimited records; [`replicate`] turns it
//! into exactly one committed segment, or into nothing at all.

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::Result;
use crate::model::{Record, RecordId};
use crate::storage::{LogStore, WriteSegment};

/// Summary of a committed replication batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replicated {
    /// Number of records in the segment.
    pub records: u64,
    /// Encoded size of the records, newlines included.
    pub bytes: u64,
    /// Lowest record id in the segment.
    pub low: RecordId,
    /// Highest record id in the segment.
    pub high: RecordId,
}

/// How a replication batch ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicateOutcome {
    /// A segment was committed.
    Committed(Replicated),
    /// The batch held no records; nothing was committed.
    NoRecords,
}

/// Commits the records read from `body` as one new segment.
///
/// Records are appended as they arrive. If reading, decoding or appending
/// fails, the segment is deleted and the error returned, so a failed batch
/// never leaves a visible segment. A failure to commit is returned as is; the
/// store decides what becomes of the half-written segment.
pub async fn replicate<R>(store: &dyn LogStore, body: R) -> Result<ReplicateOutcome>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut segment = store.create().await?;

    let written = match write_records(segment.as_mut(), body).await {
        Ok(written) => written,
        Err(e) => {
            if let Err(delete_err) = segment.delete().await {
                tracing::error!(
                    error = %delete_err,
                    "failed to delete segment after failed replication"
                );
            }
            return Err(e);
        }
    };

    let Some(replicated) = written else {
        segment.delete().await?;
        return Ok(ReplicateOutcome::NoRecords);
    };

    segment.close(replicated.low, replicated.high).await?;
    tracing::debug!(
        records = replicated.records,
        bytes = replicated.bytes,
        low = %replicated.low,
        high = %replicated.high,
        "committed replicated segment"
    );
    Ok(ReplicateOutcome::Committed(replicated))
}

/// Appends every record in `body` and tracks the watermarks.
///
/// Returns `None` if the body held no records.
async fn write_records<R>(segment: &mut dyn WriteSegment, mut body: R) -> Result<Option<Replicated>>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut summary: Option<Replicated> = None;
    let mut line = Vec::new();
    loop {
        line.clear();
        if body.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }

        let record = Record::decode(Bytes::copy_from_slice(&line))?;
        segment.write(&record).await?;

        let size = record.line.len() as u64 + 1;
        summary = Some(match summary {
            None => Replicated {
                records: 1,
                bytes: size,
                low: record.id,
                high: record.id,
            },
            Some(s) => Replicated {
                records: s.records + 1,
                bytes: s.bytes + size,
                low: s.low.min(record.id),
                high: s.high.max(record.id),
            },
        });
    }
    Ok(summary)
}

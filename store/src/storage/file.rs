//! File-backed log store.
//!
//! Each segment is one file of newline-delimited records in the store's root
//! directory. An open segment is written to `<nonce>.active`; committing it
//! syncs the file and renames it to `<low>_<high>_<nonce>.flushed`, so a
//! segment becomes visible atomically with its watermarks fixed in its name.
//! Queries only ever look at `.flushed` files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{LogStore, RecordFeed, WriteSegment, select_records};
use crate::error::{Error, Result};
use crate::model::{RECORD_ID_LEN, Record, RecordId};
use crate::query::{QueryParams, QueryResult};

const ACTIVE_EXT: &str = "active";
const FLUSHED_EXT: &str = "flushed";

/// A log store keeping one file per segment.
pub struct FileLog {
    root: PathBuf,
    feed: RecordFeed,
}

/// A committed segment file.
#[derive(Debug)]
struct SegmentFile {
    path: PathBuf,
    low: RecordId,
    high: RecordId,
}

impl FileLog {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            Error::Storage(format!("creating {}: {}", root.display(), e))
        })?;

        let mut stale = 0;
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == ACTIVE_EXT) {
                stale += 1;
            }
        }
        if stale > 0 {
            tracing::warn!(
                root = %root.display(),
                stale,
                "found uncommitted segment files; they are never queried and may be removed"
            );
        }

        Ok(Self {
            root,
            feed: RecordFeed::new(),
        })
    }

    async fn committed_segments(&self) -> Result<Vec<SegmentFile>> {
        let mut segments = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == FLUSHED_EXT) {
                continue;
            }
            match parse_segment_name(&path) {
                Some((low, high)) => segments.push(SegmentFile { path, low, high }),
                None => {
                    tracing::warn!(path = %path.display(), "ignoring malformed segment file name")
                }
            }
        }
        Ok(segments)
    }
}

fn parse_segment_name(path: &Path) -> Option<(RecordId, RecordId)> {
    let stem = path.file_stem()?.to_str()?;
    let mut parts = stem.split('_');
    let low = parts.next()?;
    let high = parts.next()?;
    let _nonce = parts.next()?;
    if parts.next().is_some() || low.len() != RECORD_ID_LEN || high.len() != RECORD_ID_LEN {
        return None;
    }
    Some((
        RecordId::parse(low.as_bytes()).ok()?,
        RecordId::parse(high.as_bytes()).ok()?,
    ))
}

async fn read_records(path: &Path) -> Result<Vec<Record>> {
    let contents = Bytes::from(fs::read(path).await?);
    contents
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            Record::decode(contents.slice_ref(line))
                .map_err(|e| Error::Storage(format!("corrupt segment {}: {}", path.display(), e)))
        })
        .collect()
}

#[async_trait]
impl LogStore for FileLog {
    async fn query(&self, params: &QueryParams, stats_only: bool) -> Result<QueryResult> {
        let matcher = params.matcher()?;
        let mut result = QueryResult::new(params.clone());
        result.nodes_queried = 1;

        for segment in self.committed_segments().await? {
            if !params.overlaps(segment.low, segment.high) {
                continue;
            }
            result.segments_queried += 1;
            result.max_data_set_size += fs::metadata(&segment.path).await?.len();
            if !stats_only {
                let records = read_records(&segment.path).await?;
                result
                    .records
                    .extend(select_records(params, &matcher, &records));
            }
        }
        result.records.sort();
        Ok(result)
    }

    fn stream(&self, params: &QueryParams) -> Result<BoxStream<'static, Bytes>> {
        Ok(self.feed.subscribe(params.matcher()?))
    }

    async fn create(&self) -> Result<Box<dyn WriteSegment>> {
        let nonce = RecordId::new().to_string();
        let path = self.root.join(format!("{}.{}", nonce, ACTIVE_EXT));
        let file = File::create(&path)
            .await
            .map_err(|e| Error::Storage(format!("creating {}: {}", path.display(), e)))?;
        Ok(Box::new(FileSegment {
            root: self.root.clone(),
            nonce,
            path,
            writer: Some(BufWriter::new(file)),
            written: Vec::new(),
            feed: self.feed.clone(),
        }))
    }
}

struct FileSegment {
    root: PathBuf,
    nonce: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    /// Records written so far, published to live streams on commit.
    written: Vec<Record>,
    feed: RecordFeed,
}

impl FileSegment {
    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::Storage("segment is no longer open".to_string()))
    }
}

#[async_trait]
impl WriteSegment for FileSegment {
    async fn write(&mut self, record: &Record) -> Result<()> {
        let writer = self.writer()?;
        writer.write_all(&record.line).await?;
        writer.write_all(b"\n").await?;
        self.written.push(record.clone());
        Ok(())
    }

    async fn close(&mut self, low: RecordId, high: RecordId) -> Result<()> {
        let writer = self.writer()?;
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        self.writer = None;

        let committed = self
            .root
            .join(format!("{}_{}_{}.{}", low, high, self.nonce, FLUSHED_EXT));
        fs::rename(&self.path, &committed).await.map_err(|e| {
            Error::Storage(format!(
                "committing {} as {}: {}",
                self.path.display(),
                committed.display(),
                e
            ))
        })?;

        // Committed from here on; nothing below may fail.
        let written = std::mem::take(&mut self.written);
        if self.feed.has_subscribers() {
            self.feed.publish(written);
        }
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        // Drop the handle before unlinking.
        self.writer()?;
        self.writer = None;
        self.written.clear();
        fs::remove_file(&self.path)
            .await
            .map_err(|e| Error::Storage(format!("removing {}: {}", self.path.display(), e)))
    }
}

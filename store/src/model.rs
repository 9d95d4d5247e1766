//! Core data types for the store node.
//!
//! A record is a single line of bytes. It starts with a record id, a
//! hyphenated UUIDv7, optionally followed by a space and an opaque payload:
//!
//! ```text
//! 0190a5f2-7c3e-7b4a-9d1e-3f2a1b0c9d8e GET /index.html 200
//! |------------- record id -----------| |--- payload ---|
//! ```
//!
//! The id embeds the record's creation time with millisecond precision and
//! ids compare in time order, which makes the id the key used for segment
//! watermarks and for ordering query results.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use uuid::{NoContext, Timestamp, Uuid};

use crate::error::{Error, Result};

/// Length of the textual record id at the start of every record.
pub const RECORD_ID_LEN: usize = 36;

/// Time-ordered identifier of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Creates a new id for the current time.
    ///
    /// Ids created by the same process are strictly increasing.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an id carrying the given time.
    ///
    /// Sub-millisecond precision is dropped. Two ids created for the same
    /// millisecond are ordered randomly.
    pub fn at(time: DateTime<Utc>) -> Self {
        let secs = time.timestamp().max(0) as u64;
        let ts = Timestamp::from_unix(NoContext, secs, time.timestamp_subsec_nanos());
        Self(Uuid::new_v7(ts))
    }

    /// Parses an id from its 36-byte hyphenated form.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_ID_LEN {
            return Err(Error::Encoding(format!(
                "record id must be {} bytes, got {}",
                RECORD_ID_LEN,
                bytes.len()
            )));
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::Encoding("record id is not valid UTF-8".to_string()))?;
        let uuid = Uuid::try_parse(text)
            .map_err(|e| Error::Encoding(format!("invalid record id {:?}: {}", text, e)))?;
        if uuid.get_version_num() != 7 {
            return Err(Error::Encoding(format!(
                "record id {} is not time-ordered (version {})",
                text,
                uuid.get_version_num()
            )));
        }
        Ok(Self(uuid))
    }

    /// Returns the time embedded in the id.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
            .get_timestamp()
            .and_then(|ts| {
                let (secs, nanos) = ts.to_unix();
                DateTime::from_timestamp(secs as i64, nanos)
            })
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// A single log record.
///
/// Records are immutable once written. `line` holds the complete encoded
/// record without the trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The record's id, decoded from the start of `line`.
    pub id: RecordId,
    /// The encoded record.
    pub line: Bytes,
}

impl Record {
    /// Builds a record from an id and a payload.
    pub fn new(id: RecordId, payload: impl AsRef<[u8]>) -> Self {
        let payload = payload.as_ref();
        let mut line = BytesMut::with_capacity(RECORD_ID_LEN + 1 + payload.len());
        line.put_slice(id.to_string().as_bytes());
        if !payload.is_empty() {
            line.put_u8(b' ');
            line.put_slice(payload);
        }
        Self {
            id,
            line: line.freeze(),
        }
    }

    /// Decodes a record from one line (without the trailing newline).
    pub fn decode(line: Bytes) -> Result<Self> {
        if line.len() < RECORD_ID_LEN {
            return Err(Error::Encoding(format!(
                "record too short: {} bytes",
                line.len()
            )));
        }
        if line.len() > RECORD_ID_LEN && line[RECORD_ID_LEN] != b' ' {
            return Err(Error::Encoding(
                "record id must be followed by a space".to_string(),
            ));
        }
        let id = RecordId::parse(&line[..RECORD_ID_LEN])?;
        Ok(Self { id, line })
    }

    /// Returns the payload following the record id.
    pub fn payload(&self) -> &[u8] {
        self.line.get(RECORD_ID_LEN + 1..).unwrap_or_default()
    }
}

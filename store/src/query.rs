//! Query parameters and results.
//!
//! [`QueryParams`] travel between nodes as URL query strings ([`QueryRequest`]
//! is the wire form). A [`QueryResult`] travels as a response: its statistics
//! in `X-Store-*` headers and its records as a newline-delimited body, so the
//! response to a `HEAD` request is exactly the stats-only answer.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::{Record, RecordId};

pub const HEADER_FROM: HeaderName = HeaderName::from_static("x-store-from");
pub const HEADER_TO: HeaderName = HeaderName::from_static("x-store-to");
/// Carries `q` percent-encoded, since header values cannot hold control
/// characters and lose surrounding whitespace.
pub const HEADER_Q: HeaderName = HeaderName::from_static("x-store-q");
pub const HEADER_REGEX: HeaderName = HeaderName::from_static("x-store-regex");
pub const HEADER_NODES_QUERIED: HeaderName = HeaderName::from_static("x-store-nodes-queried");
pub const HEADER_SEGMENTS_QUERIED: HeaderName =
    HeaderName::from_static("x-store-segments-queried");
pub const HEADER_MAX_DATA_SET_SIZE: HeaderName =
    HeaderName::from_static("x-store-max-data-set-size");
pub const HEADER_ERROR_COUNT: HeaderName = HeaderName::from_static("x-store-error-count");
pub const HEADER_DURATION: HeaderName = HeaderName::from_static("x-store-duration");

/// Width of the query window when `from` is not given.
fn default_window() -> TimeDelta {
    TimeDelta::hours(1)
}

/// Query parameters as they appear in a URL query string.
///
/// Every field is optional on the wire; [`QueryParams::from_request`] fills
/// in defaults and validates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Lower time bound (RFC 3339, inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Upper time bound (RFC 3339, inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Match expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    /// Whether `q` is a regular expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<bool>,
}

/// A validated log query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParams {
    /// Earliest record time to match (inclusive).
    pub from: DateTime<Utc>,
    /// Latest record time to match (inclusive).
    pub to: DateTime<Utc>,
    /// Match expression. Empty matches every record.
    pub q: String,
    /// Whether `q` is a regular expression rather than a substring.
    pub regex: bool,
}

impl QueryParams {
    /// Validates a wire request, resolving missing bounds against `clock`.
    ///
    /// `to` defaults to now and `from` to one hour before `to`.
    pub fn from_request(request: QueryRequest, clock: &dyn Clock) -> Result<Self> {
        let to = match request.to.as_deref() {
            Some(s) => parse_time("to", s)?,
            None => clock.now(),
        };
        let from = match request.from.as_deref() {
            Some(s) => parse_time("from", s)?,
            None => to - default_window(),
        };
        if from > to {
            return Err(Error::InvalidInput(format!(
                "from ({}) must not be after to ({})",
                format_time(&from),
                format_time(&to)
            )));
        }

        let params = Self {
            from,
            to,
            q: request.q.unwrap_or_default(),
            regex: request.regex.unwrap_or(false),
        };
        params.matcher()?;
        Ok(params)
    }

    /// Returns the wire form of these parameters.
    ///
    /// Bounds are always encoded so that every peer resolves the same window.
    pub fn to_request(&self) -> QueryRequest {
        QueryRequest {
            from: Some(format_time(&self.from)),
            to: Some(format_time(&self.to)),
            q: (!self.q.is_empty()).then(|| self.q.clone()),
            regex: self.regex.then_some(true),
        }
    }

    /// Compiles the match expression.
    pub fn matcher(&self) -> Result<RecordMatcher> {
        if self.q.is_empty() {
            return Ok(RecordMatcher::All);
        }
        if self.regex {
            let regex = Regex::new(&self.q)
                .map_err(|e| Error::InvalidInput(format!("invalid regex: {}", e)))?;
            return Ok(RecordMatcher::Regex(regex));
        }
        Ok(RecordMatcher::Substring(self.q.as_bytes().to_vec()))
    }

    /// Returns true if a segment spanning `low..=high` may hold matching records.
    pub fn overlaps(&self, low: RecordId, high: RecordId) -> bool {
        low.timestamp() <= self.to && high.timestamp() >= self.from
    }

    /// Returns true if the record's time falls within the query window.
    pub fn covers(&self, record: &Record) -> bool {
        let time = record.id.timestamp();
        self.from <= time && time <= self.to
    }
}

/// Compiled form of a query's match expression.
#[derive(Debug, Clone)]
pub enum RecordMatcher {
    All,
    Substring(Vec<u8>),
    Regex(Regex),
}

impl RecordMatcher {
    /// Returns true if the record's payload matches.
    pub fn matches(&self, record: &Record) -> bool {
        let payload = record.payload();
        match self {
            RecordMatcher::All => true,
            RecordMatcher::Substring(needle) => {
                needle.len() <= payload.len()
                    && payload.windows(needle.len()).any(|w| w == needle.as_slice())
            }
            RecordMatcher::Regex(regex) => regex.is_match(payload),
        }
    }
}

/// The answer to a query, from one node or merged across many.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub params: QueryParams,
    /// Number of nodes that answered.
    pub nodes_queried: u64,
    /// Number of segments consulted.
    pub segments_queried: u64,
    /// Total bytes of the consulted segments.
    pub max_data_set_size: u64,
    /// Number of peers that failed to answer.
    pub error_count: u64,
    /// Time taken to produce the result.
    pub duration: String,
    /// Matching records in key order. Empty for stats-only queries.
    pub records: Vec<Bytes>,
}

impl QueryResult {
    /// Creates an empty result for the given parameters.
    pub fn new(params: QueryParams) -> Self {
        Self {
            params,
            nodes_queried: 0,
            segments_queried: 0,
            max_data_set_size: 0,
            error_count: 0,
            duration: String::new(),
            records: Vec::new(),
        }
    }

    /// Folds another partial result into this one.
    ///
    /// Counters are summed. Records are merged into key order with identical
    /// copies (as served by replicas) collapsed. Fails without modifying
    /// `self` if the two results answer different queries.
    pub fn merge(&mut self, other: QueryResult) -> Result<()> {
        if self.params != other.params {
            return Err(Error::Merge(format!(
                "params don't match: {:?} != {:?}",
                self.params, other.params
            )));
        }
        self.nodes_queried += other.nodes_queried;
        self.segments_queried += other.segments_queried;
        self.max_data_set_size += other.max_data_set_size;
        self.error_count += other.error_count;
        if !other.records.is_empty() {
            self.records.extend(other.records);
            self.records.sort();
            self.records.dedup();
        }
        Ok(())
    }

    /// Writes the params and statistics into response headers.
    pub fn encode_headers(&self, headers: &mut HeaderMap) -> Result<()> {
        let params = &self.params;
        headers.insert(HEADER_FROM, header_value(&format_time(&params.from))?);
        headers.insert(HEADER_TO, header_value(&format_time(&params.to))?);
        headers.insert(HEADER_Q, header_value(&urlencoding::encode(&params.q))?);
        headers.insert(
            HEADER_REGEX,
            HeaderValue::from_static(if params.regex { "true" } else { "false" }),
        );
        headers.insert(HEADER_NODES_QUERIED, HeaderValue::from(self.nodes_queried));
        headers.insert(
            HEADER_SEGMENTS_QUERIED,
            HeaderValue::from(self.segments_queried),
        );
        headers.insert(
            HEADER_MAX_DATA_SET_SIZE,
            HeaderValue::from(self.max_data_set_size),
        );
        headers.insert(HEADER_ERROR_COUNT, HeaderValue::from(self.error_count));
        headers.insert(HEADER_DURATION, header_value(&self.duration)?);
        Ok(())
    }

    /// Encodes the records as a newline-delimited body.
    pub fn encode_body(&self) -> Bytes {
        let len = self.records.iter().map(|r| r.len() + 1).sum();
        let mut body = BytesMut::with_capacity(len);
        for record in &self.records {
            body.put_slice(record);
            body.put_u8(b'\n');
        }
        body.freeze()
    }

    /// Decodes a result from response headers and body.
    pub fn decode(headers: &HeaderMap, body: Bytes) -> Result<Self> {
        let params = QueryParams {
            from: parse_time("from", header_str(headers, &HEADER_FROM)?)?,
            to: parse_time("to", header_str(headers, &HEADER_TO)?)?,
            q: urlencoding::decode(header_str(headers, &HEADER_Q)?)
                .map_err(|e| Error::Encoding(format!("invalid header {}: {}", HEADER_Q, e)))?
                .into_owned(),
            regex: header_parse(headers, &HEADER_REGEX)?,
        };
        let records = body
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| body.slice_ref(line))
            .collect();

        Ok(Self {
            params,
            nodes_queried: header_parse(headers, &HEADER_NODES_QUERIED)?,
            segments_queried: header_parse(headers, &HEADER_SEGMENTS_QUERIED)?,
            max_data_set_size: header_parse(headers, &HEADER_MAX_DATA_SET_SIZE)?,
            error_count: header_parse(headers, &HEADER_ERROR_COUNT)?,
            duration: header_str(headers, &HEADER_DURATION)?.to_string(),
            records,
        })
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(name: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::InvalidInput(format!("invalid {} {:?}: {}", name, value, e)))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_bytes(value.as_bytes())
        .map_err(|e| Error::Encoding(format!("invalid header value {:?}: {}", value, e)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<&'a str> {
    let value = headers
        .get(name)
        .ok_or_else(|| Error::Encoding(format!("missing header {}", name)))?;
    std::str::from_utf8(value.as_bytes())
        .map_err(|_| Error::Encoding(format!("header {} is not valid UTF-8", name)))
}

fn header_parse<T>(headers: &HeaderMap, name: &HeaderName) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let value = header_str(headers, name)?;
    value
        .parse()
        .map_err(|e| Error::Encoding(format!("invalid header {}={:?}: {}", name, value, e)))
}

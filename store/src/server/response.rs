//! Response encoding for query results and record streams.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};

use super::error::ApiError;
use crate::query::QueryResult;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Renders a query result: stats in headers, records in the body.
pub(super) fn query_response(result: &QueryResult) -> Result<Response, ApiError> {
    let mut response = result.encode_body().into_response();
    result.encode_headers(response.headers_mut())?;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
    Ok(response)
}

/// Renders a live record stream, one newline-terminated record per chunk.
pub(super) fn record_stream_response<S>(records: S) -> Response
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    let body = Body::from_stream(records.map(|record| Ok::<_, Infallible>(terminate(record))));
    (
        [
            (header::CONTENT_TYPE, TEXT_PLAIN),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

fn terminate(record: Bytes) -> Bytes {
    let mut line = BytesMut::with_capacity(record.len() + 1);
    line.put_slice(&record);
    line.put_u8(b'\n');
    line.freeze()
}

//! Prometheus metrics for the store node.

use axum::http::Method;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

/// Labels for HTTP request metrics.
///
/// `endpoint` is the matched route, so `/query` and `/query?q=x` share a
/// series.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabelsWithStatus {
    pub method: HttpMethod,
    pub endpoint: String,
    pub status: u16,
}

/// HTTP method label value.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Other,
}

impl From<&Method> for HttpMethod {
    fn from(method: &Method) -> Self {
        match *method {
            Method::GET => HttpMethod::Get,
            Method::HEAD => HttpMethod::Head,
            Method::POST => HttpMethod::Post,
            _ => HttpMethod::Other,
        }
    }
}

/// Container for all Prometheus metrics.
pub struct Metrics {
    registry: Registry,

    /// Segments committed from replication pushes.
    pub replicated_segments_total: Counter,

    /// Records committed from replication pushes.
    pub replicated_records_total: Counter,

    /// Bytes committed from replication pushes.
    pub replicated_bytes_total: Counter,

    pub http_requests_total: Family<HttpLabelsWithStatus, Counter>,

    /// Request latency in seconds. Streaming responses are measured up to the
    /// start of the body.
    pub http_request_duration_seconds: Family<HttpLabelsWithStatus, Histogram>,

    pub http_requests_in_flight: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let replicated_segments_total = Counter::default();
        registry.register(
            "store_replicated_segments",
            "Segments replicated from ingest nodes",
            replicated_segments_total.clone(),
        );

        let replicated_records_total = Counter::default();
        registry.register(
            "store_replicated_records",
            "Records replicated from ingest nodes",
            replicated_records_total.clone(),
        );

        let replicated_bytes_total = Counter::default();
        registry.register(
            "store_replicated_bytes",
            "Bytes replicated from ingest nodes",
            replicated_bytes_total.clone(),
        );

        let http_requests_total = Family::<HttpLabelsWithStatus, Counter>::default();
        registry.register(
            "http_requests",
            "Total number of HTTP requests",
            http_requests_total.clone(),
        );

        // Buckets from 1ms to ~8s
        let http_request_duration_seconds =
            Family::<HttpLabelsWithStatus, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 14))
            });
        registry.register(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
            http_request_duration_seconds.clone(),
        );

        let http_requests_in_flight = Gauge::default();
        registry.register(
            "http_requests_in_flight",
            "Number of HTTP requests currently being processed",
            http_requests_in_flight.clone(),
        );

        Self {
            registry,
            replicated_segments_total,
            replicated_records_total,
            replicated_bytes_total,
            http_requests_total,
            http_request_duration_seconds,
            http_requests_in_flight,
        }
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}

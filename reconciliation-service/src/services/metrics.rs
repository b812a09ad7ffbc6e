//! Prometheus metrics for reconciliation-service.

use axum::{extract::MatchedPath, extract::Request, middleware::Next, response::Response};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::time::Instant;

/// Counter for HTTP requests by route, method and status.
pub static HTTP_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_http_requests_total",
        "Total number of HTTP requests",
        &["method", "route", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS")
});

/// Histogram for HTTP request duration by route.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "route"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "reconciliation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for ingested rows by outcome (inserted, skipped, error).
pub static INGESTED_TRANSACTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_ingested_transactions_total",
        "Total number of ingested transaction rows by outcome",
        &["source", "outcome"]
    )
    .expect("Failed to register INGESTED_TRANSACTIONS")
});

/// Counter for allocations written by the matching endpoint.
pub static ALLOCATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_allocations_total",
        "Total number of transaction-to-invoice allocations",
        &["status"]
    )
    .expect("Failed to register ALLOCATIONS")
});

/// Counter for event publication outcomes.
pub static EVENTS_PUBLISHED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "reconciliation_events_published_total",
        "Total number of published events by topic and outcome",
        &["topic", "outcome"]
    )
    .expect("Failed to register EVENTS_PUBLISHED")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&INGESTED_TRANSACTIONS);
    Lazy::force(&ALLOCATIONS);
    Lazy::force(&EVENTS_PUBLISHED);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record HTTP request count and latency, labelled by the matched route
/// template so ids in paths do not explode cardinality.
pub async fn http_metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS
        .with_label_values(&[method.as_str(), route.as_str(), status.as_str()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method.as_str(), route.as_str()])
        .observe(start.elapsed().as_secs_f64());

    response
}

/// Record ingestion row outcomes for one batch.
pub fn record_ingestion(source: &str, inserted: usize, skipped: usize, errors: usize) {
    for (outcome, count) in [("inserted", inserted), ("skipped", skipped), ("error", errors)] {
        if count > 0 {
            INGESTED_TRANSACTIONS
                .with_label_values(&[source, outcome])
                .inc_by(count as f64);
        }
    }
}

/// Record an allocation attempt.
pub fn record_allocation(status: &str) {
    ALLOCATIONS.with_label_values(&[status]).inc();
}

/// Record the outcome of an event publication.
pub fn record_event_published(topic: &str, outcome: &str) {
    EVENTS_PUBLISHED.with_label_values(&[topic, outcome]).inc();
}

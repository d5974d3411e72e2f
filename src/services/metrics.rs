//! Prometheus metrics for the reconciliation batch service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for HTTP requests by method, path and status.
pub static HTTP_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS")
});

/// Histogram for HTTP request duration by method and path.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "recon_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION")
});

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "recon_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for batch operations by operation and outcome.
pub static BATCH_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_batch_operations_total",
        "Total number of reconciliation batch operations",
        &["operation", "status"]
    )
    .expect("Failed to register BATCH_OPERATIONS")
});

/// Counter for emitted match proposals by mapping type.
pub static MATCH_PROPOSALS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_match_proposals_total",
        "Total number of match proposals emitted",
        &["match_type"]
    )
    .expect("Failed to register MATCH_PROPOSALS")
});

/// Counter for ingested feed records by feed and outcome.
pub static INGESTED_RECORDS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_ingested_records_total",
        "Total number of ingested feed records",
        &["feed", "status"]
    )
    .expect("Failed to register INGESTED_RECORDS")
});

/// Counter for errors by kind.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS);
    Lazy::force(&HTTP_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&BATCH_OPERATIONS);
    Lazy::force(&MATCH_PROPOSALS);
    Lazy::force(&INGESTED_RECORDS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

/// Record a batch operation.
pub fn record_batch_operation(operation: &str, status: &str) {
    BATCH_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record an emitted match proposal.
pub fn record_match_proposal(match_type: &str) {
    MATCH_PROPOSALS.with_label_values(&[match_type]).inc();
}

/// Record an ingested record outcome.
pub fn record_ingested_record(feed: &str, status: &str) {
    INGESTED_RECORDS.with_label_values(&[feed, status]).inc();
}

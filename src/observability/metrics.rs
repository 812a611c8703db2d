//! Metrics collection and exposition.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize metrics exporter and server.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!("Metrics server listening on http://{}", addr);
}

/// Record a completed request-response cycle.
pub fn record_request(method: &str, status: u16, route: &str, started: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("route", route.to_string()),
    ];

    counter!("stevedore_http_requests_total", &labels).increment(1);
    histogram!("stevedore_http_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());
}

/// Record a pre-authorization round trip against the backend.
pub fn record_api_request(status: u16, method: &str) {
    let labels = [
        ("code", status.to_string()),
        ("method", method.to_string()),
    ];
    counter!("stevedore_internal_api_requests", &labels).increment(1);
}

/// Bytes buffered from backend pass-through (rejection) responses.
pub fn record_api_failure_bytes(n: u64) {
    counter!("stevedore_internal_api_failure_response_bytes").increment(n);
}

/// Track the number of registered key watchers.
pub fn keywatchers_add(delta: i64) {
    gauge!("stevedore_keywatcher_keywatchers").increment(delta as f64);
}

/// Etag short-circuit outcome, partitioned by result.
pub fn record_etag_cache(result: &'static str) {
    counter!("stevedore_etag_cache_requests", "result" => result).increment(1);
}

/// Object storage upload accounting.
pub fn record_object_storage(status: &'static str) {
    counter!("stevedore_object_storage_upload_requests", "status" => status).increment(1);
}

pub fn object_storage_open(delta: i64) {
    gauge!("stevedore_object_storage_upload_open").increment(delta as f64);
}

pub fn record_object_storage_bytes(n: u64) {
    counter!("stevedore_object_storage_upload_bytes").increment(n);
}

pub fn record_object_storage_time(started: Instant) {
    histogram!("stevedore_object_storage_upload_time")
        .record(started.elapsed().as_secs_f64());
}

/// Multipart form rewriting accounting, partitioned by processor name.
pub fn record_multipart_request(kind: &'static str) {
    counter!("stevedore_multipart_upload_requests", "type" => kind).increment(1);
}

pub fn record_multipart_file(kind: &'static str) {
    counter!("stevedore_multipart_upload_files", "type" => kind).increment(1);
}

pub fn record_multipart_bytes(kind: &'static str, n: u64) {
    counter!("stevedore_multipart_upload_bytes", "type" => kind).increment(n);
}

/// Admission queue accounting.
pub fn queue_busy(queue: &'static str, delta: i64) {
    gauge!("stevedore_queueing_busy", "queue" => queue).increment(delta as f64);
}

pub fn queue_waiting(queue: &'static str, delta: i64) {
    gauge!("stevedore_queueing_waiting", "queue" => queue).increment(delta as f64);
}

pub fn record_queue_error(queue: &'static str, kind: &'static str) {
    counter!("stevedore_queueing_errors", "queue" => queue, "type" => kind).increment(1);
}

/// Archive cache hits and misses.
pub fn record_archive_cache(result: &'static str) {
    counter!("stevedore_git_archive_cache", "result" => result).increment(1);
}

/// Send-URL injector accounting.
pub fn record_send_url(status: &'static str) {
    counter!("stevedore_send_url_requests", "status" => status).increment(1);
}

/// Long-lived connection tracking (terminal sessions).
pub fn record_terminal_session(delta: i64) {
    gauge!("stevedore_terminal_sessions_active").increment(delta as f64);
}

use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

use crate::reconcile::SourcePlan;

/// Metric name prefix for all aggregator metrics
const PREFIX: &str = "meeting_aggregator";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Sync Metrics
    pub static ref SYNC_CYCLES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_sync_cycles_total"), "Per-source sync cycles by outcome"),
        &["source", "outcome"]
    ).expect("Failed to create sync_cycles_total metric");

    pub static ref SYNC_CYCLE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_sync_cycle_duration_seconds"),
            "Duration of one source's sync cycle in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["source"]
    ).expect("Failed to create sync_cycle_duration_seconds metric");

    pub static ref SYNC_PLAN_CHANGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_sync_plan_changes_total"), "Applied record changes"),
        &["entity", "action"]
    ).expect("Failed to create sync_plan_changes_total metric");

    pub static ref SYNC_IMPORT_PROBLEMS: GaugeVec = GaugeVec::new(
        Opts::new(
            format!("{PREFIX}_sync_import_problems"),
            "Entries skipped or excluded in the last applied cycle"
        ),
        &["source"]
    ).expect("Failed to create sync_import_problems metric");

    pub static ref STORED_MEETINGS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_stored_meetings"), "Meetings stored per source"),
        &["source"]
    ).expect("Failed to create stored_meetings metric");

    pub static ref SYNC_HEALTHY: Gauge = Gauge::new(
        format!("{PREFIX}_sync_healthy"),
        "1 while the sync pipeline is healthy, 0 once it has been marked degraded"
    ).expect("Failed to create sync_healthy metric");

    // Query Metrics
    pub static ref QUERY_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_query_errors_total"), "Rejected or failed client queries"),
        &["kind"]
    ).expect("Failed to create query_errors_total metric");

    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (tests call this repeatedly)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(SYNC_CYCLES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SYNC_CYCLE_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(SYNC_PLAN_CHANGES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SYNC_IMPORT_PROBLEMS.clone()));
    let _ = REGISTRY.register(Box::new(STORED_MEETINGS.clone()));
    let _ = REGISTRY.register(Box::new(SYNC_HEALTHY.clone()));
    let _ = REGISTRY.register(Box::new(QUERY_ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));
    SYNC_HEALTHY.set(1.0);

    tracing::info!("Metrics system initialized successfully");
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

/// Record the end of one source's cycle. `outcome` is "synced" or an error kind.
pub fn record_sync_cycle(source: &str, outcome: &str, duration: Duration) {
    SYNC_CYCLES_TOTAL
        .with_label_values(&[source, outcome])
        .inc();
    SYNC_CYCLE_DURATION_SECONDS
        .with_label_values(&[source])
        .observe(duration.as_secs_f64());
}

/// Record an applied plan and the resulting per-source totals.
pub fn record_applied_plan(source: &str, plan: &SourcePlan, meeting_count: usize) {
    let changes = [
        ("service_body", "insert", plan.service_bodies.to_insert.len()),
        ("service_body", "update", plan.service_bodies.to_update.len()),
        ("service_body", "delete", plan.service_bodies.to_delete.len()),
        ("meeting", "insert", plan.meetings.to_insert.len()),
        ("meeting", "update", plan.meetings.to_update.len()),
        ("meeting", "delete", plan.meetings.to_delete.len()),
        ("format", "insert", plan.formats.to_insert.len()),
        ("format", "update", plan.formats.to_update.len()),
        ("format", "delete", plan.formats.to_delete.len()),
    ];
    for (entity, action, count) in changes {
        if count > 0 {
            SYNC_PLAN_CHANGES_TOTAL
                .with_label_values(&[entity, action])
                .inc_by(count as f64);
        }
    }
    SYNC_IMPORT_PROBLEMS
        .with_label_values(&[source])
        .set(plan.problems.len() as f64);
    STORED_MEETINGS
        .with_label_values(&[source])
        .set(meeting_count as f64);
}

/// Drop per-source series of a source that is gone from configuration.
pub fn forget_source(source: &str) {
    let _ = SYNC_IMPORT_PROBLEMS.remove_label_values(&[source]);
    let _ = STORED_MEETINGS.remove_label_values(&[source]);
}

pub fn set_sync_healthy(healthy: bool) {
    SYNC_HEALTHY.set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_query_error(kind: &str) {
    QUERY_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

/// Update process memory usage
pub fn update_memory_usage() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    // Resident set size, in kB
                    if let Some(Ok(kb)) = rest.split_whitespace().next().map(str::parse::<f64>) {
                        PROCESS_MEMORY_BYTES.set(kb * 1024.0);
                        return;
                    }
                }
            }
        }
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    update_memory_usage();

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

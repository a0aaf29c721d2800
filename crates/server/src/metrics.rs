//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the certflow server:
//! - HTTP request metrics (latency, counts)
//! - Certificate requests by composite state (collected at scrape time)
//! - Orchestrator status (collected at scrape time)
//!
//! Core metrics (issuance, ticketing, transitions, sweep) are registered
//! into the same registry.

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use regex_lite::Regex;

use certflow_core::RequestState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "certflow_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("certflow_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "certflow_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Request Metrics (collected dynamically)
// =============================================================================

/// Certificate requests by current composite state.
pub static REQUESTS_BY_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "certflow_requests_by_state",
            "Current certificate request count by state",
        ),
        &["state"],
    )
    .unwrap()
});

// =============================================================================
// Orchestrator Metrics (collected dynamically)
// =============================================================================

/// Orchestrator running state (1 = running, 0 = stopped).
pub static ORCHESTRATOR_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "certflow_orchestrator_running",
        "Whether background processing is running (1) or stopped (0)",
    )
    .unwrap()
});

/// Background jobs running or waiting for a slot.
pub static ORCHESTRATOR_ACTIVE_JOBS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "certflow_orchestrator_active_jobs",
        "Number of background request jobs in progress",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Requests
    registry
        .register(Box::new(REQUESTS_BY_STATE.clone()))
        .unwrap();

    // Orchestrator
    registry
        .register(Box::new(ORCHESTRATOR_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(ORCHESTRATOR_ACTIVE_JOBS.clone()))
        .unwrap();

    // Core metrics (issuance, ticketing, lifecycle, sweep)
    for metric in certflow_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Collect dynamic metrics from current application state.
///
/// Called before encoding so the gauges reflect the store at scrape time.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let orchestrator = state.orchestrator();

    let status = orchestrator.status().await;
    ORCHESTRATOR_RUNNING.set(if status.running { 1 } else { 0 });
    ORCHESTRATOR_ACTIVE_JOBS.set(status.active_jobs as i64);

    for request_state in RequestState::ALL {
        let count = status
            .requests_by_state
            .get(request_state.as_str())
            .copied()
            .unwrap_or(0);
        REQUESTS_BY_STATE
            .with_label_values(&[request_state.as_str()])
            .set(count);
    }
}

static UUID_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});

static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\d+(/|$)").unwrap());

/// Normalize a path for metric labels (replace IDs with placeholders).
pub fn normalize_path(path: &str) -> String {
    let result = UUID_SEGMENT.replace_all(path, "{id}");
    let result = NUMERIC_SEGMENT.replace_all(&result, "/{id}$1");
    result.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_uuid() {
        let path = "/api/v1/certificates/550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(normalize_path(path), "/api/v1/certificates/{id}");
    }

    #[test]
    fn test_normalize_path_uuid_with_suffix() {
        let path = "/api/v1/certificates/550e8400-e29b-41d4-a716-446655440000/revoke";
        assert_eq!(normalize_path(path), "/api/v1/certificates/{id}/revoke");
    }

    #[test]
    fn test_normalize_path_numeric() {
        let path = "/api/v1/certificates/12345";
        assert_eq!(normalize_path(path), "/api/v1/certificates/{id}");
    }

    #[test]
    fn test_normalize_path_no_ids() {
        let path = "/api/v1/health";
        assert_eq!(normalize_path(path), "/api/v1/health");
    }

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();

        let output = encode_metrics().unwrap();
        assert!(output.contains("certflow_http_requests_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_registry_contains_core_metrics() {
        // Prometheus only outputs metrics that have been accessed
        REQUESTS_BY_STATE.with_label_values(&["PENDING"]).set(0);
        ORCHESTRATOR_RUNNING.set(0);
        certflow_core::metrics::SWEEP_RUNS.inc();
        certflow_core::metrics::REQUESTS_SUBMITTED.inc();

        let output = encode_metrics().unwrap();

        assert!(output.contains("certflow_requests_by_state"));
        assert!(output.contains("certflow_orchestrator_running"));
        assert!(output.contains("certflow_sweep_runs_total"));
        assert!(output.contains("certflow_requests_submitted_total"));
    }
}

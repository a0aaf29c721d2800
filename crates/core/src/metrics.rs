//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Issuance (PKI attempts, outcomes, duration)
//! - Ticket reconciliation (ticket operations, divergences)
//! - Lifecycle store (accepted and rejected transitions)
//! - Background sweep (runs, expirations, rotations)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Issuance Metrics
// =============================================================================

/// Individual PKI issue calls by result.
pub static ISSUANCE_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "certflow_issuance_attempts_total",
            "Total PKI issuance calls",
        ),
        &["result"], // "success", "transient", "permanent"
    )
    .unwrap()
});

/// Final issuance outcomes per request.
pub static ISSUANCE_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "certflow_issuance_outcomes_total",
            "Issuance outcomes per certificate request",
        ),
        &["result"], // "issued", "rejected", "exhausted"
    )
    .unwrap()
});

/// Time from issuance start to final outcome, retries included.
pub static ISSUANCE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "certflow_issuance_duration_seconds",
            "Duration of issuance including retries",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0, 60.0, 180.0]),
        &["result"],
    )
    .unwrap()
});

/// Backoff sleeps taken, per call site.
pub static RETRY_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("certflow_retry_attempts_total", "Total retried backend calls"),
        &["operation"],
    )
    .unwrap()
});

// =============================================================================
// Ticketing Metrics
// =============================================================================

/// Ticketing system calls by operation and result.
pub static TICKET_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "certflow_ticket_operations_total",
            "Total ticketing system operations",
        ),
        &["operation", "result"], // operation: "create", "adopt", "fetch", "update"
    )
    .unwrap()
});

/// Divergences detected between the issuance and ticket facets.
pub static DIVERGENCES_DETECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "certflow_divergences_detected_total",
            "Facet divergences detected by the reconciler",
        ),
        &["kind"],
    )
    .unwrap()
});

// =============================================================================
// Lifecycle Metrics
// =============================================================================

/// Accepted transitions by composite state.
pub static STATE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "certflow_state_transitions_total",
            "Accepted lifecycle transitions",
        ),
        &["from_state", "to_state"],
    )
    .unwrap()
});

/// Rejected (out-of-order or duplicate) events.
pub static TRANSITIONS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "certflow_transitions_rejected_total",
            "Lifecycle events rejected as invalid for the current state",
        ),
        &["event"],
    )
    .unwrap()
});

/// Requests accepted by the validator.
pub static REQUESTS_SUBMITTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "certflow_requests_submitted_total",
        "Total certificate requests accepted",
    )
    .unwrap()
});

/// Requests refused by the validator.
pub static REQUESTS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "certflow_requests_rejected_total",
            "Certificate requests refused by validation",
        ),
        &["field"],
    )
    .unwrap()
});

// =============================================================================
// Sweep Metrics
// =============================================================================

pub static SWEEP_RUNS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("certflow_sweep_runs_total", "Total reconciliation sweeps").unwrap()
});

pub static CERTIFICATES_EXPIRED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "certflow_certificates_expired_total",
        "Certificates marked expired by the sweep",
    )
    .unwrap()
});

pub static CERTIFICATES_REVOKED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "certflow_certificates_revoked_total",
        "Certificates revoked through the orchestrator",
    )
    .unwrap()
});

pub static CERTIFICATES_ROTATED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "certflow_certificates_rotated_total",
        "Successor requests submitted for certificates close to expiry",
    )
    .unwrap()
});

/// Certificates the PKI issued that could not be recorded.
pub static CERTIFICATES_ORPHANED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "certflow_certificates_orphaned_total",
        "Issued certificates lost to a storage error",
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Issuance
        Box::new(ISSUANCE_ATTEMPTS.clone()),
        Box::new(ISSUANCE_OUTCOMES.clone()),
        Box::new(ISSUANCE_DURATION.clone()),
        Box::new(RETRY_ATTEMPTS.clone()),
        // Ticketing
        Box::new(TICKET_OPERATIONS.clone()),
        Box::new(DIVERGENCES_DETECTED.clone()),
        // Lifecycle
        Box::new(STATE_TRANSITIONS.clone()),
        Box::new(TRANSITIONS_REJECTED.clone()),
        Box::new(REQUESTS_SUBMITTED.clone()),
        Box::new(REQUESTS_REJECTED.clone()),
        // Sweep
        Box::new(SWEEP_RUNS.clone()),
        Box::new(CERTIFICATES_EXPIRED.clone()),
        Box::new(CERTIFICATES_REVOKED.clone()),
        Box::new(CERTIFICATES_ROTATED.clone()),
        Box::new(CERTIFICATES_ORPHANED.clone()),
    ]
}

//! Orchestrator configuration.

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Configuration for the certificate orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Enable/disable background processing.
    /// When disabled, submitted requests stay `PENDING` until issuance and
    /// reconciliation are triggered manually via API.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How often the reconciliation sweep runs (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Records fetched per page while the sweep collects its work.
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,

    /// Maximum requests processed concurrently (0 = unlimited).
    /// When the limit is reached, new work waits until a slot is free.
    #[serde(default)]
    pub max_concurrent_requests: usize,

    /// Certificates this close to expiry get a successor request (seconds).
    /// 0 disables rotation.
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold_secs: u64,

    /// Retry policy for PKI issue and revoke calls.
    #[serde(default)]
    pub issuance_retry: RetryPolicy,

    /// Retry policy for ticket create, fetch and update calls.
    #[serde(default)]
    pub ticket_retry: RetryPolicy,
}

fn default_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_sweep_batch_size() -> usize {
    100
}

fn default_rotation_threshold() -> u64 {
    30 * 24 * 3600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch_size(),
            max_concurrent_requests: 0,
            rotation_threshold_secs: default_rotation_threshold(),
            issuance_retry: RetryPolicy::default(),
            ticket_retry: RetryPolicy::default(),
        }
    }
}

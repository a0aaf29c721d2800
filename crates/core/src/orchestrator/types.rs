//! Types for the certificate orchestrator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::{LifecycleError, RequestState};
use crate::request::ValidationError;
use crate::retry::RetryError;

/// Errors returned by [`super::CertificateOrchestrator::submit`].
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The request was malformed; nothing was stored.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to store request: {0}")]
    Storage(#[from] LifecycleError),
}

/// Errors returned by [`super::CertificateOrchestrator::revoke`].
#[derive(Debug, Error)]
pub enum RevokeError {
    #[error("certificate request not found: {0}")]
    NotFound(String),

    /// The request holds no live certificate.
    #[error("request {request_id} in state {state} has no certificate to revoke")]
    NotRevocable {
        request_id: String,
        state: RequestState,
    },

    #[error("PKI revocation failed: {0}")]
    Backend(#[from] RetryError),

    #[error(transparent)]
    Lifecycle(LifecycleError),
}

impl From<LifecycleError> for RevokeError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(id) => RevokeError::NotFound(id),
            other => RevokeError::Lifecycle(other),
        }
    }
}

/// What one reconciliation sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub started_at: Option<DateTime<Utc>>,
    /// Certificates marked expired.
    pub expired: usize,
    /// Successor requests submitted for certificates close to expiry.
    #[serde(default)]
    pub rotated: usize,
    /// Requests whose issuance was driven (not yet started, or orphaned).
    pub issuance_driven: usize,
    /// Requests whose ticket was reconciled.
    pub reconciled: usize,
    /// Requests whose processing hit a storage error.
    pub errors: usize,
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Whether background processing is running.
    pub running: bool,
    /// Background jobs currently running or waiting for a slot.
    pub active_jobs: usize,
    /// Requests with an issuance call in flight.
    pub issuing: usize,
    /// Requests with a reconciliation pass in flight.
    pub reconciling: usize,
    /// Record count per composite state.
    pub requests_by_state: BTreeMap<String, i64>,
    pub last_sweep: Option<SweepReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoke_error_from_lifecycle() {
        let err: RevokeError = LifecycleError::NotFound("req-1".to_string()).into();
        assert!(matches!(err, RevokeError::NotFound(ref id) if id == "req-1"));

        let err: RevokeError = LifecycleError::Database("locked".to_string()).into();
        assert!(matches!(err, RevokeError::Lifecycle(_)));
    }

    #[test]
    fn test_status_serialization() {
        let mut status = OrchestratorStatus {
            running: true,
            ..Default::default()
        };
        status
            .requests_by_state
            .insert(RequestState::Issued.to_string(), 3);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["running"], true);
        assert_eq!(json["requests_by_state"]["ISSUED"], 3);
        assert!(json["last_sweep"].is_null());
    }
}

//! Drives the PKI side of a certificate request.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::inflight::InFlight;
use crate::lifecycle::{IssuanceFacet, LifecycleError, LifecycleEvent, LifecycleStore};
use crate::metrics;
use crate::pki::{IssuedCertificate, PkiEngine, PkiIssueRequest};
use crate::request::CertificateRequest;
use crate::retry::{RetryError, RetryPolicy};

/// Result of an [`IssuanceCoordinator::issue`] call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IssuanceOutcome {
    /// The request holds a certificate, issued now or by an earlier call.
    Issued { certificate: IssuedCertificate },
    /// Issuance ended without a certificate.
    Failed {
        reason: String,
        permanent: bool,
        attempts: u32,
    },
    /// Another task is issuing this request right now.
    InProgress,
}

impl IssuanceOutcome {
    /// The settled outcome recorded on the issuance facet, if any.
    fn recorded(facet: &IssuanceFacet) -> Option<Self> {
        match facet {
            IssuanceFacet::Pending | IssuanceFacet::Issuing { .. } => None,
            IssuanceFacet::Failed {
                reason,
                permanent,
                attempts,
                ..
            } => Some(Self::Failed {
                reason: reason.clone(),
                permanent: *permanent,
                attempts: *attempts,
            }),
            IssuanceFacet::Issued { certificate }
            | IssuanceFacet::Expired { certificate, .. }
            | IssuanceFacet::Revoked { certificate, .. } => Some(Self::Issued {
                certificate: certificate.clone(),
            }),
        }
    }

    pub fn is_issued(&self) -> bool {
        matches!(self, Self::Issued { .. })
    }
}

/// Calls the PKI engine for a request and reports the result to the
/// lifecycle store.
///
/// Issuing is idempotent: a request whose issuance facet already settled is
/// answered from the record without contacting the PKI engine, and at most
/// one task issues a given request at a time.
pub struct IssuanceCoordinator {
    pki: Arc<dyn PkiEngine>,
    store: Arc<LifecycleStore>,
    policy: RetryPolicy,
    audit: Option<AuditHandle>,
    in_flight: InFlight,
}

impl IssuanceCoordinator {
    pub fn new(pki: Arc<dyn PkiEngine>, store: Arc<LifecycleStore>, policy: RetryPolicy) -> Self {
        Self {
            pki,
            store,
            policy,
            audit: None,
            in_flight: InFlight::new(),
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether a task is currently issuing `request_id`.
    pub fn is_in_flight(&self, request_id: &str) -> bool {
        self.in_flight.contains(request_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Issue the certificate for `request_id`.
    ///
    /// A record left in `Issuing` with no running task (e.g. after a restart)
    /// is resumed rather than started again.
    pub async fn issue(&self, request_id: &str) -> Result<IssuanceOutcome, LifecycleError> {
        let record = self.store.get(request_id)?;
        if let Some(outcome) = IssuanceOutcome::recorded(&record.issuance) {
            debug!(request_id, "Issuance already settled, not calling PKI");
            return Ok(outcome);
        }

        let Some(_guard) = self.in_flight.try_begin(request_id) else {
            debug!(request_id, "Issuance already in progress");
            return Ok(IssuanceOutcome::InProgress);
        };

        // Re-read under the claim; a task that just finished may have settled it.
        let mut record = self.store.get(request_id)?;
        if let Some(outcome) = IssuanceOutcome::recorded(&record.issuance) {
            return Ok(outcome);
        }

        if record.issuance == IssuanceFacet::Pending {
            record = self
                .store
                .transition(request_id, LifecycleEvent::IssuanceStarted)
                .await?;
        } else {
            info!(request_id, "Resuming interrupted issuance");
        }

        self.run_issuance(&record).await
    }

    async fn run_issuance(
        &self,
        record: &CertificateRequest,
    ) -> Result<IssuanceOutcome, LifecycleError> {
        let request_id = record.id.as_str();
        let request = PkiIssueRequest::from(record);
        let pki = &self.pki;
        let started = Instant::now();

        info!(
            request_id,
            backend = pki.name(),
            common_name = %request.common_name,
            ttl_secs = request.ttl_secs,
            "Requesting certificate from PKI"
        );

        let result = self
            .policy
            .run("pki_issue", |attempt| {
                let request = &request;
                async move {
                    let result = pki.issue(request).await;
                    let label = match &result {
                        Ok(_) => "success",
                        Err(e) if e.is_transient() => "transient",
                        Err(_) => "permanent",
                    };
                    metrics::ISSUANCE_ATTEMPTS.with_label_values(&[label]).inc();
                    debug!(request_id, attempt, result = label, "PKI issue attempt finished");
                    result
                }
            })
            .await;

        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(attempted) => {
                let certificate = attempted.value;
                match self
                    .store
                    .transition(
                        request_id,
                        LifecycleEvent::IssuanceSucceeded {
                            certificate: certificate.clone(),
                        },
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(LifecycleError::DuplicateSerial { serial, holder }) => {
                        warn!(
                            request_id,
                            serial = %serial,
                            holder = %holder,
                            "PKI returned a serial already held by another request"
                        );
                        let failure = RetryError::Permanent {
                            attempts: attempted.attempts,
                            reason: format!(
                                "PKI returned serial {} already held by request {}",
                                serial, holder
                            ),
                        };
                        return self.record_failure(request_id, failure, elapsed).await;
                    }
                    Err(e) => {
                        // The record stays ISSUING and a later sweep issues again.
                        metrics::CERTIFICATES_ORPHANED.inc();
                        error!(
                            request_id,
                            serial = %certificate.serial_number,
                            expires_at = %certificate.expires_at,
                            error = %e,
                            "PKI issued a certificate that could not be recorded"
                        );
                        if let Some(ref audit) = self.audit {
                            audit
                                .emit(AuditEvent::CertificateOrphaned {
                                    request_id: request_id.to_string(),
                                    serial_number: certificate.serial_number.clone(),
                                    reason: e.to_string(),
                                })
                                .await;
                        }
                        return Err(e);
                    }
                }

                metrics::ISSUANCE_OUTCOMES.with_label_values(&["issued"]).inc();
                metrics::ISSUANCE_DURATION
                    .with_label_values(&["issued"])
                    .observe(elapsed);
                info!(
                    request_id,
                    serial = %certificate.serial_number,
                    expires_at = %certificate.expires_at,
                    attempts = attempted.attempts,
                    "Certificate issued"
                );

                if let Some(ref audit) = self.audit {
                    audit
                        .emit(AuditEvent::CertificateIssued {
                            request_id: request_id.to_string(),
                            serial_number: certificate.serial_number.clone(),
                            expires_at: certificate.expires_at,
                            attempts: attempted.attempts,
                        })
                        .await;
                }

                Ok(IssuanceOutcome::Issued { certificate })
            }
            Err(failure) => self.record_failure(request_id, failure, elapsed).await,
        }
    }

    async fn record_failure(
        &self,
        request_id: &str,
        failure: RetryError,
        elapsed: f64,
    ) -> Result<IssuanceOutcome, LifecycleError> {
        let permanent = failure.is_permanent();
        let attempts = failure.attempts();
        let reason = failure.reason().to_string();
        let label = if permanent { "rejected" } else { "exhausted" };

        self.store
            .transition(
                request_id,
                LifecycleEvent::IssuanceFailed {
                    reason: reason.clone(),
                    permanent,
                    attempts,
                },
            )
            .await?;

        metrics::ISSUANCE_OUTCOMES.with_label_values(&[label]).inc();
        metrics::ISSUANCE_DURATION
            .with_label_values(&[label])
            .observe(elapsed);
        warn!(request_id, permanent, attempts, reason = %reason, "Issuance failed");

        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::IssuanceFailed {
                    request_id: request_id.to_string(),
                    reason: reason.clone(),
                    permanent,
                    attempts,
                })
                .await;
        }

        Ok(IssuanceOutcome::Failed {
            reason,
            permanent,
            attempts,
        })
    }
}

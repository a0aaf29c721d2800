//! Keeps each request's ticket in step with its issuance facet.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Divergence, ReconcileAction, ReconcileOutcome};
use crate::audit::{AuditEvent, AuditHandle};
use crate::inflight::InFlight;
use crate::lifecycle::{IssuanceFacet, LifecycleError, LifecycleEvent, LifecycleStore, TicketFacet};
use crate::metrics;
use crate::request::CertificateRequest;
use crate::retry::{RetryError, RetryPolicy};
use crate::ticketing::{
    status_note, TicketRecord, TicketSpec, TicketStatus, TicketUpdate, TicketingSystem,
};

/// Ensures exactly one ticket exists per request and that its status tracks
/// the issuance facet.
///
/// Reconciliation never touches the issuance facet. A ticket that cannot be
/// created marks the request `TICKET_FAILED` but leaves any certificate in
/// place. Passes on the same request never overlap; a pass requested while
/// another runs makes the running one go around again.
pub struct TicketReconciler {
    ticketing: Arc<dyn TicketingSystem>,
    store: Arc<LifecycleStore>,
    policy: RetryPolicy,
    audit: Option<AuditHandle>,
    in_flight: InFlight,
}

impl TicketReconciler {
    pub fn new(
        ticketing: Arc<dyn TicketingSystem>,
        store: Arc<LifecycleStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            ticketing,
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

    pub fn is_in_flight(&self, request_id: &str) -> bool {
        self.in_flight.contains(request_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Run reconciliation passes for `request_id` until nothing is left to do
    /// or a backend call gives up.
    pub async fn reconcile(&self, request_id: &str) -> Result<ReconcileOutcome, LifecycleError> {
        let record = self.store.get(request_id)?;

        let Some(mut guard) = self.in_flight.try_begin(request_id) else {
            debug!(request_id, "Reconciliation already running, deferring");
            let mut outcome = ReconcileOutcome::new(request_id, record.state);
            outcome.ticket_id = record.ticket_id().map(str::to_string);
            outcome.actions.push(ReconcileAction::Deferred);
            return Ok(outcome);
        };

        let mut outcome = ReconcileOutcome::new(request_id, record.state);
        loop {
            self.pass(request_id, &mut outcome).await?;
            if !guard.rerun_requested() {
                break;
            }
            debug!(request_id, "Reconciliation requested during pass, running again");
        }

        Ok(outcome)
    }

    async fn pass(
        &self,
        request_id: &str,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), LifecycleError> {
        let mut record = self.store.get(request_id)?;
        outcome.state = record.state;

        let facet = record.ticket.clone();
        let remote_status = match &facet {
            TicketFacet::Failed { .. } => return Ok(()),
            TicketFacet::Pending => {
                if matches!(record.issuance, IssuanceFacet::Issued { .. }) {
                    self.diverged(request_id, Divergence::IssuedWithoutTicket, outcome)
                        .await;
                }
                match self.ensure_ticket(&record, outcome).await? {
                    Some((updated, status)) => {
                        record = updated;
                        status
                    }
                    None => return Ok(()),
                }
            }
            TicketFacet::Created {
                ticket_id,
                synced_status,
                ..
            } => {
                let ticketing = &self.ticketing;
                let fetched = self
                    .policy
                    .run("ticket_fetch", |_| ticketing.get_ticket(ticket_id))
                    .await;
                metrics::TICKET_OPERATIONS
                    .with_label_values(&["fetch", result_label(&fetched)])
                    .inc();

                let ticket = match fetched {
                    Ok(attempted) => attempted.value,
                    Err(failure) => {
                        self.update_failed(request_id, ticket_id, &failure, outcome)
                            .await;
                        return Ok(());
                    }
                };

                if let Some(expected) = synced_status {
                    if ticket.status != *expected && ticket.status != TicketStatus::Approved {
                        let drift = Divergence::StatusDrift {
                            expected: *expected,
                            found: ticket.status,
                        };
                        self.diverged(request_id, drift, outcome).await;
                    }
                }
                ticket.status
            }
        };

        outcome.ticket_id = record.ticket_id().map(str::to_string);
        self.sync(&record, remote_status, outcome).await
    }

    /// Find or create the request's ticket. Returns `None` once creation gave
    /// up and the ticket facet was marked failed.
    async fn ensure_ticket(
        &self,
        record: &CertificateRequest,
        outcome: &mut ReconcileOutcome,
    ) -> Result<Option<(CertificateRequest, TicketStatus)>, LifecycleError> {
        let request_id = record.id.as_str();
        let spec = TicketSpec::from(record);
        let ticketing = &self.ticketing;

        let result = self
            .policy
            .run("ticket_create", |attempt| {
                let spec = &spec;
                async move {
                    // A previous attempt may have created the ticket and lost the response.
                    if let Some(existing) =
                        ticketing.find_by_correlation(&spec.correlation_id).await?
                    {
                        return Ok((existing, true));
                    }
                    debug!(request_id, attempt, "Creating ticket");
                    ticketing.create_ticket(spec).await.map(|t| (t, false))
                }
            })
            .await;

        match result {
            Ok(attempted) => {
                let (ticket, adopted): (TicketRecord, bool) = attempted.value;
                let operation = if adopted { "adopt" } else { "create" };
                metrics::TICKET_OPERATIONS
                    .with_label_values(&[operation, "success"])
                    .inc();

                let updated = self
                    .store
                    .transition(
                        request_id,
                        LifecycleEvent::TicketCreated {
                            ticket_id: ticket.ticket_id.clone(),
                        },
                    )
                    .await?;
                outcome.state = updated.state;

                info!(
                    request_id,
                    ticket_id = %ticket.ticket_id,
                    adopted,
                    backend = self.ticketing.name(),
                    "Ticket confirmed"
                );
                if let Some(ref audit) = self.audit {
                    audit
                        .emit(AuditEvent::TicketCreated {
                            request_id: request_id.to_string(),
                            ticket_id: ticket.ticket_id.clone(),
                            adopted,
                        })
                        .await;
                }

                outcome.actions.push(if adopted {
                    ReconcileAction::Adopted {
                        ticket_id: ticket.ticket_id.clone(),
                    }
                } else {
                    ReconcileAction::Created {
                        ticket_id: ticket.ticket_id.clone(),
                    }
                });

                Ok(Some((updated, ticket.status)))
            }
            Err(failure) => {
                metrics::TICKET_OPERATIONS
                    .with_label_values(&["create", "failure"])
                    .inc();

                let updated = self
                    .store
                    .transition(
                        request_id,
                        LifecycleEvent::TicketFailed {
                            reason: failure.reason().to_string(),
                            attempts: failure.attempts(),
                        },
                    )
                    .await?;
                outcome.state = updated.state;

                warn!(
                    request_id,
                    attempts = failure.attempts(),
                    reason = failure.reason(),
                    "Ticket creation failed"
                );
                if let Some(ref audit) = self.audit {
                    audit
                        .emit(AuditEvent::TicketCreationFailed {
                            request_id: request_id.to_string(),
                            reason: failure.reason().to_string(),
                            attempts: failure.attempts(),
                        })
                        .await;
                }

                outcome.actions.push(ReconcileAction::CreationFailed {
                    reason: failure.reason().to_string(),
                    attempts: failure.attempts(),
                });
                Ok(None)
            }
        }
    }

    /// Push the desired status to the ticket and record it as synced.
    async fn sync(
        &self,
        record: &CertificateRequest,
        remote_status: TicketStatus,
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), LifecycleError> {
        let request_id = record.id.as_str();
        let Some(ticket_id) = record.ticket_id() else {
            return Ok(());
        };

        if remote_status == TicketStatus::Approved && record.issuance == IssuanceFacet::Pending {
            // Leave the approval visible; the orchestrator re-drives issuance.
            self.diverged(request_id, Divergence::ApprovedWithoutIssuance, outcome)
                .await;
            return Ok(());
        }

        let desired = TicketStatus::desired_for(&record.issuance);
        if remote_status != desired {
            let update = TicketUpdate {
                status: desired,
                note: status_note(&record.issuance),
            };
            let ticketing = &self.ticketing;
            let result = self
                .policy
                .run("ticket_update", |_| ticketing.update_ticket(ticket_id, &update))
                .await;
            metrics::TICKET_OPERATIONS
                .with_label_values(&["update", result_label(&result)])
                .inc();

            if let Err(failure) = result {
                self.update_failed(request_id, ticket_id, &failure, outcome)
                    .await;
                return Ok(());
            }
            debug!(request_id, ticket_id, from = %remote_status, to = %desired, "Updated ticket status");
        }

        if record.ticket.synced_status() == Some(desired) {
            return Ok(());
        }

        let updated = self
            .store
            .transition(request_id, LifecycleEvent::TicketStatusSynced { status: desired })
            .await?;
        outcome.state = updated.state;

        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::TicketSynced {
                    request_id: request_id.to_string(),
                    ticket_id: ticket_id.to_string(),
                    status: desired.to_string(),
                })
                .await;
        }
        outcome.actions.push(ReconcileAction::Synced {
            ticket_id: ticket_id.to_string(),
            status: desired,
        });
        Ok(())
    }

    async fn diverged(
        &self,
        request_id: &str,
        divergence: Divergence,
        outcome: &mut ReconcileOutcome,
    ) {
        metrics::DIVERGENCES_DETECTED
            .with_label_values(&[divergence.kind()])
            .inc();
        warn!(
            request_id,
            kind = divergence.kind(),
            detail = %divergence.detail(),
            "Facet divergence detected"
        );
        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::DivergenceDetected {
                    request_id: request_id.to_string(),
                    kind: divergence.kind().to_string(),
                    detail: divergence.detail(),
                })
                .await;
        }
        if !outcome.divergences.contains(&divergence) {
            outcome.divergences.push(divergence);
        }
    }

    async fn update_failed(
        &self,
        request_id: &str,
        ticket_id: &str,
        failure: &RetryError,
        outcome: &mut ReconcileOutcome,
    ) {
        warn!(
            request_id,
            ticket_id,
            attempts = failure.attempts(),
            reason = failure.reason(),
            "Ticket update failed, leaving for the next pass"
        );
        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::TicketUpdateFailed {
                    request_id: request_id.to_string(),
                    ticket_id: ticket_id.to_string(),
                    reason: failure.reason().to_string(),
                })
                .await;
        }
        outcome.actions.push(ReconcileAction::UpdateFailed {
            ticket_id: ticket_id.to_string(),
            reason: failure.reason().to_string(),
        });
    }
}

fn result_label<T>(result: &Result<T, RetryError>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "failure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::lifecycle::{RequestState, SqliteRecordStore};
    use crate::testing::{fixtures, MockTicketingSystem};
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            attempt_timeout_ms: 10_000,
        }
    }

    fn setup(ticketing: Arc<MockTicketingSystem>) -> (TicketReconciler, Arc<LifecycleStore>) {
        let records = Arc::new(SqliteRecordStore::in_memory().unwrap());
        let store = Arc::new(LifecycleStore::new(records));
        let reconciler = TicketReconciler::new(ticketing, Arc::clone(&store), policy());
        (reconciler, store)
    }

    fn insert_awaiting_ticket(store: &LifecycleStore, serial: &str) -> CertificateRequest {
        let record = fixtures::awaiting_ticket_request("svc.example.com", serial);
        store.records().insert(&record).unwrap();
        record
    }

    #[tokio::test(start_paused = true)]
    async fn test_creates_ticket_and_completes_issued_request() {
        let ticketing = Arc::new(MockTicketingSystem::new());
        let (reconciler, store) = setup(Arc::clone(&ticketing));
        let record = insert_awaiting_ticket(&store, "AA:BB:01");

        let outcome = reconciler.reconcile(&record.id).await.unwrap();

        assert_eq!(outcome.ticket_id.as_deref(), Some("TCK-1001"));
        assert_eq!(outcome.state, RequestState::Issued);
        assert_eq!(outcome.divergences, vec![Divergence::IssuedWithoutTicket]);
        assert_eq!(
            outcome.actions,
            vec![
                ReconcileAction::Created {
                    ticket_id: "TCK-1001".to_string()
                },
                ReconcileAction::Synced {
                    ticket_id: "TCK-1001".to_string(),
                    status: TicketStatus::Issued
                },
            ]
        );

        let stored = store.get(&record.id).unwrap();
        assert_eq!(stored.ticket_id(), Some("TCK-1001"));
        assert_eq!(stored.certificate_serial(), Some("AA:BB:01"));
        assert!(stored.ticket_settled());

        let ticket = ticketing.ticket("TCK-1001").await.unwrap();
        assert_eq!(ticket.status, TicketStatus::Issued);
        assert_eq!(ticket.correlation_id.as_deref(), Some(record.id.as_str()));
        // Created with the right status, so no separate update.
        assert!(ticketing.updates().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_create_response_adopts_existing_ticket() {
        let ticketing = Arc::new(MockTicketingSystem::new());
        ticketing.lose_next_create_response().await;
        let (reconciler, store) = setup(Arc::clone(&ticketing));
        let record = fixtures::pending_request("svc.example.com");
        store.create(&record).unwrap();

        let outcome = reconciler.reconcile(&record.id).await.unwrap();

        assert_eq!(
            outcome.actions[0],
            ReconcileAction::Adopted {
                ticket_id: "TCK-1001".to_string()
            }
        );
        assert_eq!(ticketing.create_count().await, 1);
        assert_eq!(ticketing.tickets().await.len(), 1);
        assert_eq!(store.get(&record.id).unwrap().ticket_id(), Some("TCK-1001"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_creation_exhaustion_keeps_certificate() {
        let ticketing = Arc::new(MockTicketingSystem::new());
        for _ in 0..3 {
            ticketing
                .push_create_failure(BackendError::transient("HTTP 503"))
                .await;
        }
        let (reconciler, store) = setup(Arc::clone(&ticketing));
        let record = insert_awaiting_ticket(&store, "AA:BB:02");

        let outcome = reconciler.reconcile(&record.id).await.unwrap();

        assert_eq!(outcome.state, RequestState::TicketFailed);
        assert_eq!(
            outcome.actions.last(),
            Some(&ReconcileAction::CreationFailed {
                reason: "HTTP 503".to_string(),
                attempts: 3
            })
        );

        let stored = store.get(&record.id).unwrap();
        assert_eq!(stored.state, RequestState::TicketFailed);
        assert_eq!(
            stored.issuance.certificate().unwrap().serial_number,
            "AA:BB:02"
        );
        assert!(ticketing.tickets().await.is_empty());

        // The ticket facet is settled; another pass does nothing.
        let again = reconciler.reconcile(&record.id).await.unwrap();
        assert!(again.actions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_pushed_to_existing_ticket() {
        let ticketing = Arc::new(MockTicketingSystem::new());
        let (reconciler, store) = setup(Arc::clone(&ticketing));
        let record = fixtures::pending_request("svc.example.com");
        store.create(&record).unwrap();
        store
            .transition(&record.id, LifecycleEvent::IssuanceStarted)
            .await
            .unwrap();

        reconciler.reconcile(&record.id).await.unwrap();
        assert_eq!(
            ticketing.ticket("TCK-1001").await.unwrap().status,
            TicketStatus::InProgress
        );

        store
            .transition(
                &record.id,
                LifecycleEvent::IssuanceFailed {
                    reason: "PKI timed out".to_string(),
                    permanent: false,
                    attempts: 5,
                },
            )
            .await
            .unwrap();
        let outcome = reconciler.reconcile(&record.id).await.unwrap();

        assert_eq!(outcome.state, RequestState::IssuanceFailed);
        let updates = ticketing.updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "TCK-1001");
        assert_eq!(updates[0].1.status, TicketStatus::Failed);
        assert!(updates[0]
            .1
            .note
            .as_deref()
            .unwrap()
            .contains("PKI timed out"));
        assert!(store.get(&record.id).unwrap().ticket_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_approved_ticket_without_issuance_is_flagged() {
        let ticketing = Arc::new(MockTicketingSystem::new());
        let (reconciler, store) = setup(Arc::clone(&ticketing));
        let record = fixtures::pending_request("svc.example.com");
        store.create(&record).unwrap();

        reconciler.reconcile(&record.id).await.unwrap();
        ticketing
            .set_remote_status("TCK-1001", TicketStatus::Approved)
            .await;

        let outcome = reconciler.reconcile(&record.id).await.unwrap();
        assert!(outcome.needs_issuance());
        assert!(ticketing.updates().await.is_empty());
        assert_eq!(
            ticketing.ticket("TCK-1001").await.unwrap().status,
            TicketStatus::Approved
        );
        assert_eq!(store.get(&record.id).unwrap().state, RequestState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_drift_is_corrected() {
        let ticketing = Arc::new(MockTicketingSystem::new());
        let (reconciler, store) = setup(Arc::clone(&ticketing));
        let record = insert_awaiting_ticket(&store, "AA:BB:03");

        reconciler.reconcile(&record.id).await.unwrap();
        ticketing
            .set_remote_status("TCK-1001", TicketStatus::Open)
            .await;

        let outcome = reconciler.reconcile(&record.id).await.unwrap();
        assert_eq!(
            outcome.divergences,
            vec![Divergence::StatusDrift {
                expected: TicketStatus::Issued,
                found: TicketStatus::Open
            }]
        );
        assert_eq!(
            ticketing.ticket("TCK-1001").await.unwrap().status,
            TicketStatus::Issued
        );
        // Already recorded as synced, so no new history entry.
        assert!(!outcome
            .actions
            .iter()
            .any(|a| matches!(a, ReconcileAction::Synced { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_failure_leaves_record_for_next_pass() {
        let ticketing = Arc::new(MockTicketingSystem::new());
        let (reconciler, store) = setup(Arc::clone(&ticketing));
        let record = fixtures::pending_request("svc.example.com");
        store.create(&record).unwrap();
        reconciler.reconcile(&record.id).await.unwrap();

        store
            .transition(&record.id, LifecycleEvent::IssuanceStarted)
            .await
            .unwrap();
        for _ in 0..3 {
            ticketing
                .push_update_failure(BackendError::transient("HTTP 502"))
                .await;
        }

        let outcome = reconciler.reconcile(&record.id).await.unwrap();
        assert!(matches!(
            outcome.actions.last(),
            Some(ReconcileAction::UpdateFailed { .. })
        ));
        let stored = store.get(&record.id).unwrap();
        assert_eq!(stored.state, RequestState::Issuing);
        assert!(!stored.ticket_settled());

        let outcome = reconciler.reconcile(&record.id).await.unwrap();
        assert!(matches!(
            outcome.actions.last(),
            Some(ReconcileAction::Synced {
                status: TicketStatus::InProgress,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_passes_create_one_ticket() {
        let ticketing = Arc::new(MockTicketingSystem::new());
        ticketing.set_delay(Duration::from_millis(200)).await;
        let (reconciler, store) = setup(Arc::clone(&ticketing));
        let record = fixtures::pending_request("svc.example.com");
        store.create(&record).unwrap();

        let (a, b) = tokio::join!(
            reconciler.reconcile(&record.id),
            reconciler.reconcile(&record.id)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.was_deferred() || b.was_deferred());
        assert_eq!(ticketing.create_count().await, 1);
        assert_eq!(ticketing.tickets().await.len(), 1);
        assert!(!reconciler.is_in_flight(&record.id));
    }
}

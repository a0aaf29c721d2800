//! Certificate orchestrator implementation.
//!
//! Ties intake, issuance and ticket reconciliation together:
//! - Submission: validated synchronously, processed in the background
//! - Per request: issuance and reconciliation run as independent futures
//! - Sweep: periodic expiry marking, rotation of certificates close to
//!   expiry, and recovery of stalled work

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{broadcast, Notify, RwLock, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::config::ValidationConfig;
use crate::issuance::{IssuanceCoordinator, IssuanceOutcome};
use crate::lifecycle::{
    IssuanceFacet, LifecycleError, LifecycleEvent, LifecycleStore, RecordFilter, RequestState,
};
use crate::metrics;
use crate::pki::{PkiEngine, RevokeOutcome};
use crate::query::{QueryError, StatusQuery};
use crate::reconciler::{ReconcileOutcome, TicketReconciler};
use crate::request::{CertificateRequest, RawCertificateRequest, RequestValidator};
use crate::ticketing::TicketingSystem;

use super::config::OrchestratorConfig;
use super::types::{OrchestratorStatus, RevokeError, SubmitError, SweepReport};

/// Counts background jobs so callers can wait for quiescence.
struct JobTracker {
    active: AtomicUsize,
    idle: Notify,
    permits: Option<Arc<Semaphore>>,
}

impl JobTracker {
    fn new(max_concurrent: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            permits: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
        }
    }

    fn begin(self: &Arc<Self>) -> JobGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        JobGuard {
            tracker: Arc::clone(self),
        }
    }
}

struct JobGuard {
    tracker: Arc<JobTracker>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// State shared with spawned jobs and the sweep loop.
struct Shared {
    config: OrchestratorConfig,
    store: Arc<LifecycleStore>,
    issuance: IssuanceCoordinator,
    reconciler: TicketReconciler,
    audit: Option<AuditHandle>,
    jobs: Arc<JobTracker>,
    last_sweep: RwLock<Option<SweepReport>>,
}

impl Shared {
    /// Run one request's work: issuance (when asked) and reconciliation as
    /// independent futures. Completion of either side that changes the
    /// issuance facet is followed by another reconciliation pass.
    ///
    /// Returns `false` if a storage error interrupted the work.
    async fn drive(&self, request_id: &str, with_issuance: bool) -> bool {
        let issue_side = async {
            if !with_issuance {
                return true;
            }
            self.issue_then_reconcile(request_id).await
        };

        let ticket_side = async {
            match self.reconciler.reconcile(request_id).await {
                Ok(outcome) if outcome.needs_issuance() => {
                    info!(request_id, "Ticket approved without issuance, driving issuance");
                    self.issue_then_reconcile(request_id).await
                }
                Ok(outcome) => {
                    log_reconcile(&outcome);
                    true
                }
                Err(e) => {
                    warn!(request_id, error = %e, "Reconciliation failed");
                    false
                }
            }
        };

        let (issued_ok, reconciled_ok) = tokio::join!(issue_side, ticket_side);
        issued_ok && reconciled_ok
    }

    async fn issue_then_reconcile(&self, request_id: &str) -> bool {
        match self.issuance.issue(request_id).await {
            Ok(IssuanceOutcome::InProgress) => true,
            Ok(_) => match self.reconciler.reconcile(request_id).await {
                Ok(outcome) => {
                    log_reconcile(&outcome);
                    true
                }
                Err(e) => {
                    warn!(request_id, error = %e, "Reconciliation after issuance failed");
                    false
                }
            },
            Err(e) => {
                warn!(request_id, error = %e, "Issuance failed to record outcome");
                false
            }
        }
    }

    /// Spawn `drive` for a request as a background job.
    fn spawn_job(self: &Arc<Self>, request_id: String, with_issuance: bool) {
        let shared = Arc::clone(self);
        let guard = self.jobs.begin();

        tokio::spawn(async move {
            let _guard = guard;
            let _permit = match shared.jobs.permits {
                Some(ref permits) => Arc::clone(permits).acquire_owned().await.ok(),
                None => None,
            };
            debug!(request_id = %request_id, with_issuance, "Processing certificate request");
            shared.drive(&request_id, with_issuance).await;
        });
    }

    /// Page through all records matching `filter`.
    fn collect(&self, mut filter: RecordFilter) -> Result<Vec<CertificateRequest>, LifecycleError> {
        let batch = self.config.sweep_batch_size.max(1) as i64;
        filter.limit = batch;
        filter.offset = 0;

        let mut records = Vec::new();
        loop {
            let page = self.store.list(&filter)?;
            let fetched = page.len() as i64;
            records.extend(page);
            if fetched < batch {
                return Ok(records);
            }
            filter.offset += batch;
        }
    }

    async fn sweep(&self) -> Result<SweepReport, LifecycleError> {
        let now = Utc::now();
        let mut report = SweepReport {
            started_at: Some(now),
            ..Default::default()
        };

        // Expire certificates whose validity ended.
        let expiring = self.collect(
            RecordFilter::new()
                .with_state(RequestState::Issued)
                .with_state(RequestState::AwaitingTicket)
                .with_state(RequestState::TicketFailed)
                .with_expires_before(now),
        )?;
        for record in expiring {
            match self
                .store
                .transition(&record.id, LifecycleEvent::Expired)
                .await
            {
                Ok(updated) => {
                    report.expired += 1;
                    metrics::CERTIFICATES_EXPIRED.inc();
                    let serial = updated
                        .certificate_serial()
                        .unwrap_or_default()
                        .to_string();
                    info!(request_id = %updated.id, serial = %serial, "Certificate expired");
                    if let Some(ref audit) = self.audit {
                        audit
                            .emit(AuditEvent::CertificateExpired {
                                request_id: updated.id.clone(),
                                serial_number: serial,
                            })
                            .await;
                    }
                }
                Err(e) if e.is_transition() => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(request_id = %record.id, error = %e, "Failed to mark certificate expired");
                }
            }
        }

        // Submit successors for certificates close to expiry. They are PENDING,
        // so the pass below drives their issuance.
        if self.config.rotation_threshold_secs > 0 {
            let threshold = chrono::Duration::seconds(
                self.config.rotation_threshold_secs.min(i32::MAX as u64) as i64,
            );
            let due = self.collect(
                RecordFilter::new()
                    .with_state(RequestState::Issued)
                    .with_expires_before(now + threshold),
            )?;
            for record in due.iter().filter(|r| r.due_for_rotation(now, threshold)) {
                match self.rotate(record, now).await {
                    Ok(true) => report.rotated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.errors += 1;
                        warn!(request_id = %record.id, error = %e, "Failed to rotate certificate");
                    }
                }
            }
        }

        // id -> whether issuance must be driven
        let mut work: BTreeMap<String, bool> = BTreeMap::new();

        let mut live = RecordFilter::new();
        for state in RequestState::ALL.into_iter().filter(|s| !s.is_final()) {
            live = live.with_state(state);
        }
        for record in self.collect(live)? {
            let with_issuance =
                !record.issuance.is_settled() && !self.issuance.is_in_flight(&record.id);
            work.insert(record.id, with_issuance);
        }

        // Final records whose ticket does not reflect the outcome yet.
        for record in self.collect(RecordFilter::new().with_unsettled_ticket())? {
            work.entry(record.id).or_insert(false);
        }

        report.issuance_driven = work.values().filter(|issue| **issue).count();
        report.reconciled = work.len();

        let limit = (self.config.max_concurrent_requests > 0)
            .then_some(self.config.max_concurrent_requests);
        let errors = AtomicUsize::new(0);
        futures::stream::iter(work)
            .for_each_concurrent(limit, |(request_id, with_issuance)| {
                let errors = &errors;
                async move {
                    if !self.drive(&request_id, with_issuance).await {
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;
        report.errors += errors.into_inner();

        metrics::SWEEP_RUNS.inc();
        info!(
            expired = report.expired,
            rotated = report.rotated,
            issuance_driven = report.issuance_driven,
            reconciled = report.reconciled,
            errors = report.errors,
            "Sweep finished"
        );

        *self.last_sweep.write().await = Some(report.clone());
        Ok(report)
    }

    /// Store a successor request for `record`. Returns `false` when the
    /// record was already rotated.
    async fn rotate(
        &self,
        record: &CertificateRequest,
        now: DateTime<Utc>,
    ) -> Result<bool, LifecycleError> {
        if let Some(successor) = self.store.successor_of(&record.id)? {
            debug!(request_id = %record.id, successor_id = %successor, "Already rotated");
            return Ok(false);
        }

        let successor = record.successor(uuid::Uuid::new_v4().to_string(), now);
        match self.store.create(&successor) {
            Ok(()) => {}
            Err(LifecycleError::AlreadyRotated { .. }) => return Ok(false),
            Err(e) => return Err(e),
        }

        metrics::CERTIFICATES_ROTATED.inc();
        let serial = record.certificate_serial().unwrap_or_default().to_string();
        info!(
            request_id = %record.id,
            successor_id = %successor.id,
            serial = %serial,
            "Submitted rotation request for certificate close to expiry"
        );

        if let Some(ref audit) = self.audit {
            audit
                .emit(AuditEvent::CertificateRotated {
                    request_id: record.id.clone(),
                    successor_id: successor.id.clone(),
                    serial_number: serial,
                    expires_at: record.expires_at().unwrap_or(now),
                })
                .await;
        }

        Ok(true)
    }
}

fn log_reconcile(outcome: &ReconcileOutcome) {
    if !outcome.actions.is_empty() && !outcome.was_deferred() {
        debug!(
            request_id = %outcome.request_id,
            state = %outcome.state,
            actions = outcome.actions.len(),
            "Reconciliation pass finished"
        );
    }
}

/// The certificate orchestrator - accepts requests and drives them through
/// issuance and ticket reconciliation.
pub struct CertificateOrchestrator {
    shared: Arc<Shared>,
    validator: RequestValidator,
    query: StatusQuery,
    pki: Arc<dyn PkiEngine>,

    // Runtime state
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CertificateOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        config: OrchestratorConfig,
        validation: ValidationConfig,
        store: Arc<LifecycleStore>,
        pki: Arc<dyn PkiEngine>,
        ticketing: Arc<dyn TicketingSystem>,
        audit: Option<AuditHandle>,
    ) -> Self {
        let mut issuance =
            IssuanceCoordinator::new(Arc::clone(&pki), Arc::clone(&store), config.issuance_retry.clone());
        let mut reconciler =
            TicketReconciler::new(ticketing, Arc::clone(&store), config.ticket_retry.clone());
        if let Some(ref audit) = audit {
            issuance = issuance.with_audit(audit.clone());
            reconciler = reconciler.with_audit(audit.clone());
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(Shared {
                jobs: Arc::new(JobTracker::new(config.max_concurrent_requests)),
                config,
                store: Arc::clone(&store),
                issuance,
                reconciler,
                audit,
                last_sweep: RwLock::new(None),
            }),
            validator: RequestValidator::new(validation),
            query: StatusQuery::new(store),
            pki,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<LifecycleStore> {
        &self.shared.store
    }

    pub fn query(&self) -> &StatusQuery {
        &self.query
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start background processing: an immediate sweep to pick up work
    /// interrupted by a restart, then one every `sweep_interval_secs`.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return;
        }

        info!(
            sweep_interval_secs = self.shared.config.sweep_interval_secs,
            max_concurrent_requests = self.shared.config.max_concurrent_requests,
            "Starting certificate orchestrator"
        );
        self.spawn_sweep_loop();
    }

    /// Stop background processing. Jobs already running finish on their own;
    /// use [`wait_idle`](Self::wait_idle) to wait for them.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Orchestrator not running");
            return;
        }

        info!("Stopping certificate orchestrator");
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_sweep_loop(&self) {
        let running = Arc::clone(&self.running);
        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_secs(shared.config.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            info!("Sweep loop started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Sweep loop received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        let _guard = shared.jobs.begin();
                        if let Err(e) = shared.sweep().await {
                            error!("Sweep failed: {}", e);
                        }
                    }
                }
            }
            info!("Sweep loop stopped");
        });
    }

    /// Validate and store a new request. Processing continues in the
    /// background while the orchestrator is running.
    pub async fn submit(&self, raw: RawCertificateRequest) -> Result<String, SubmitError> {
        let requester = raw.requester.clone();

        let record = match self.validator.validate(raw) {
            Ok(record) => record,
            Err(e) => {
                metrics::REQUESTS_REJECTED
                    .with_label_values(&[e.field.as_str()])
                    .inc();
                info!(field = %e.field, reason = %e.reason, "Rejected certificate request");
                if let Some(ref audit) = self.shared.audit {
                    audit
                        .emit(AuditEvent::RequestRejected {
                            requester,
                            field: e.field.clone(),
                            reason: e.reason.clone(),
                        })
                        .await;
                }
                return Err(e.into());
            }
        };

        self.shared.store.create(&record)?;
        metrics::REQUESTS_SUBMITTED.inc();
        info!(
            request_id = %record.id,
            requester = %record.requester,
            subject = %record.requested.subject_name,
            "Accepted certificate request"
        );

        if let Some(ref audit) = self.shared.audit {
            audit
                .emit(AuditEvent::RequestSubmitted {
                    request_id: record.id.clone(),
                    requester: record.requester.clone(),
                    subject_name: record.requested.subject_name.clone(),
                    alt_names: record.requested.subject_alt_names.clone(),
                    ttl_secs: record.requested.ttl_secs,
                })
                .await;
        }

        if self.is_running() {
            self.shared.spawn_job(record.id.clone(), true);
        }

        Ok(record.id)
    }

    pub fn get(&self, request_id: &str) -> Result<CertificateRequest, QueryError> {
        self.query.get(request_id)
    }

    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<CertificateRequest>, QueryError> {
        self.query.list(filter)
    }

    pub fn count(&self, filter: &RecordFilter) -> Result<i64, QueryError> {
        self.query.count(filter)
    }

    /// Id of the request submitted to rotate `request_id`, if any.
    pub fn successor(&self, request_id: &str) -> Result<Option<String>, QueryError> {
        self.query.successor(request_id)
    }

    /// Run issuance for a request now, followed by a reconciliation pass.
    pub async fn issue(&self, request_id: &str) -> Result<IssuanceOutcome, LifecycleError> {
        let outcome = self.shared.issuance.issue(request_id).await?;
        if outcome != IssuanceOutcome::InProgress {
            let reconciled = self.shared.reconciler.reconcile(request_id).await?;
            log_reconcile(&reconciled);
        }
        Ok(outcome)
    }

    /// Run a reconciliation pass now. Lagging issuance is re-driven in the
    /// background.
    pub async fn reconcile(&self, request_id: &str) -> Result<ReconcileOutcome, LifecycleError> {
        let outcome = self.shared.reconciler.reconcile(request_id).await?;
        if outcome.needs_issuance() {
            self.shared.spawn_job(request_id.to_string(), true);
        }
        Ok(outcome)
    }

    /// Revoke the live certificate of a request.
    pub async fn revoke(
        &self,
        request_id: &str,
        revoked_by: &str,
        reason: Option<String>,
    ) -> Result<CertificateRequest, RevokeError> {
        let record = self.shared.store.get(request_id)?;
        let serial = match &record.issuance {
            IssuanceFacet::Issued { certificate } => certificate.serial_number.clone(),
            _ => {
                return Err(RevokeError::NotRevocable {
                    request_id: request_id.to_string(),
                    state: record.state,
                })
            }
        };

        let pki = &self.pki;
        let serial_number = serial.as_str();
        let revoked = self
            .shared
            .config
            .issuance_retry
            .run("pki_revoke", |_| pki.revoke(serial_number))
            .await?;
        if revoked.value == RevokeOutcome::AlreadyRevoked {
            info!(request_id, serial = %serial, "PKI reports certificate already revoked");
        }

        let transition = self
            .shared
            .store
            .transition(
                request_id,
                LifecycleEvent::Revoked {
                    revoked_by: revoked_by.to_string(),
                    reason: reason.clone(),
                },
            )
            .await;

        // Audited once the PKI has revoked, whether or not the record accepts it.
        metrics::CERTIFICATES_REVOKED.inc();
        if let Some(ref audit) = self.shared.audit {
            audit
                .emit(AuditEvent::CertificateRevoked {
                    request_id: request_id.to_string(),
                    serial_number: serial.clone(),
                    revoked_by: revoked_by.to_string(),
                    reason,
                })
                .await;
        }

        let updated = match transition {
            Ok(updated) => updated,
            Err(LifecycleError::Transition(e)) => {
                warn!(
                    request_id,
                    serial = %serial,
                    state = %e.current_state,
                    "Certificate revoked at the PKI but the record moved on first"
                );
                return Err(RevokeError::NotRevocable {
                    request_id: request_id.to_string(),
                    state: e.current_state,
                });
            }
            Err(e) => return Err(e.into()),
        };
        info!(request_id, serial = %serial, revoked_by, "Certificate revoked");

        self.shared.spawn_job(request_id.to_string(), false);
        Ok(updated)
    }

    /// Run one sweep now.
    pub async fn sweep(&self) -> Result<SweepReport, LifecycleError> {
        self.shared.sweep().await
    }

    /// Wait until no background job or sweep is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.jobs.idle.notified();
            if self.shared.jobs.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Get current orchestrator status.
    pub async fn status(&self) -> OrchestratorStatus {
        let mut requests_by_state = BTreeMap::new();
        for state in RequestState::ALL {
            let count = self
                .shared
                .store
                .count(&RecordFilter::new().with_state(state))
                .unwrap_or(0);
            requests_by_state.insert(state.to_string(), count);
        }

        OrchestratorStatus {
            running: self.is_running(),
            active_jobs: self.shared.jobs.active.load(Ordering::SeqCst),
            issuing: self.shared.issuance.in_flight_count(),
            reconciling: self.shared.reconciler.in_flight_count(),
            requests_by_state,
            last_sweep: self.shared.last_sweep.read().await.clone(),
        }
    }
}

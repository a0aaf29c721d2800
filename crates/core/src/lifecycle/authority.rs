//! Single authority for lifecycle transitions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{
    apply_event, check_invariants, LifecycleError, LifecycleEvent, RecordFilter, RecordStore,
    RequestState,
};
use crate::audit::{AuditEvent, AuditHandle};
use crate::metrics;
use crate::request::CertificateRequest;

/// Owns every state change of every certificate request.
///
/// Transitions on the same request are applied one at a time; transitions on
/// different requests proceed in parallel. Readers never take the per-request
/// lock and always observe the last committed version.
pub struct LifecycleStore {
    records: Arc<dyn RecordStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    audit: Option<AuditHandle>,
}

impl LifecycleStore {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            locks: Mutex::new(HashMap::new()),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Persist a freshly validated `PENDING` record.
    pub fn create(&self, record: &CertificateRequest) -> Result<(), LifecycleError> {
        check_invariants(record).map_err(|reason| LifecycleError::InvariantViolation {
            request_id: record.id.clone(),
            reason,
        })?;
        self.records.insert(record)?;
        debug!(request_id = %record.id, "Created certificate request record");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<CertificateRequest, LifecycleError> {
        self.records
            .get(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<CertificateRequest>, LifecycleError> {
        self.records.list(filter)
    }

    pub fn count(&self, filter: &RecordFilter) -> Result<i64, LifecycleError> {
        self.records.count(filter)
    }

    pub fn successor_of(&self, id: &str) -> Result<Option<String>, LifecycleError> {
        self.records.find_successor(id)
    }

    /// Apply `event` to request `id` and persist the result.
    ///
    /// Returns the committed record. An event that is not a valid edge from
    /// the current state fails with [`LifecycleError::Transition`] and leaves
    /// the record unchanged.
    pub async fn transition(
        &self,
        id: &str,
        event: LifecycleEvent,
    ) -> Result<CertificateRequest, LifecycleError> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_locked(id, &event)
        };
        drop(lock);
        self.release_lock(id);

        match result {
            Ok((from, record)) => {
                metrics::STATE_TRANSITIONS
                    .with_label_values(&[from.as_str(), record.state.as_str()])
                    .inc();

                if from != record.state {
                    info!(
                        request_id = %id,
                        from = %from,
                        to = %record.state,
                        event = event.kind(),
                        "Certificate request state changed"
                    );
                } else {
                    debug!(request_id = %id, state = %from, event = event.kind(), "Facet updated");
                }

                if let Some(ref audit) = self.audit {
                    audit
                        .emit(AuditEvent::RequestStateChanged {
                            request_id: id.to_string(),
                            from_state: from.to_string(),
                            to_state: record.state.to_string(),
                            event: event.kind().to_string(),
                            cause: event.cause(),
                        })
                        .await;
                }

                Ok(record)
            }
            Err(LifecycleError::Transition(e)) => {
                metrics::TRANSITIONS_REJECTED
                    .with_label_values(&[event.kind()])
                    .inc();
                warn!(
                    request_id = %id,
                    state = %e.current_state,
                    event = %e.attempted_event,
                    "Rejected lifecycle event"
                );

                if let Some(ref audit) = self.audit {
                    audit
                        .emit(AuditEvent::TransitionRejected {
                            request_id: id.to_string(),
                            current_state: e.current_state.to_string(),
                            attempted_event: e.attempted_event.clone(),
                        })
                        .await;
                }

                Err(LifecycleError::Transition(e))
            }
            Err(e) => Err(e),
        }
    }

    fn apply_locked(
        &self,
        id: &str,
        event: &LifecycleEvent,
    ) -> Result<(RequestState, CertificateRequest), LifecycleError> {
        let current = self.get(id)?;
        let next = apply_event(&current, event, Utc::now())?;

        if let LifecycleEvent::IssuanceSucceeded { certificate } = event {
            if let Some(holder) = self.records.find_by_serial(&certificate.serial_number)? {
                if holder != id {
                    return Err(LifecycleError::DuplicateSerial {
                        serial: certificate.serial_number.clone(),
                        holder,
                    });
                }
            }
        }

        check_invariants(&next).map_err(|reason| LifecycleError::InvariantViolation {
            request_id: id.to_string(),
            reason,
        })?;

        self.records.save(&next)?;
        Ok((current.state, next))
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the per-request lock once no other task holds or awaits it.
    fn release_lock(&self, id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(id);
            }
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

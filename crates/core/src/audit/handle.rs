use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::AuditEvent;

/// An audit event stamped with the time it was emitted.
#[derive(Debug, Clone)]
pub struct AuditEventEnvelope {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
}

impl AuditEventEnvelope {
    fn now(event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Handle for emitting audit events.
///
/// Cloned into every component that records lifecycle activity. Events are
/// sent through a bounded channel and persisted by the [`super::AuditWriter`].
/// Emission never fails the caller; delivery problems are logged.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditEventEnvelope>,
}

impl AuditHandle {
    pub fn new(tx: mpsc::Sender<AuditEventEnvelope>) -> Self {
        Self { tx }
    }

    /// A handle plus the receiving end, for tests that inspect emitted events.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<AuditEventEnvelope>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    /// Emit an event, waiting for channel capacity if needed.
    pub async fn emit(&self, event: AuditEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.tx.send(AuditEventEnvelope::now(event)).await {
            tracing::error!(event_type, "Failed to emit audit event: {}", e);
        }
    }

    /// Emit an event from a non-async context.
    ///
    /// Must not be called from within the runtime.
    pub fn emit_blocking(&self, event: AuditEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.tx.blocking_send(AuditEventEnvelope::now(event)) {
            tracing::error!(event_type, "Failed to emit audit event: {}", e);
        }
    }

    /// Emit without waiting. Returns false if the event was dropped.
    pub fn try_emit(&self, event: AuditEvent) -> bool {
        let event_type = event.event_type();
        match self.tx.try_send(AuditEventEnvelope::now(event)) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(event_type, "Failed to emit audit event: {}", e);
                false
            }
        }
    }

    /// True once the writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted(id: &str) -> AuditEvent {
        AuditEvent::RequestSubmitted {
            request_id: id.to_string(),
            requester: "alice".to_string(),
            subject_name: "svc.example.com".to_string(),
            alt_names: vec![],
            ttl_secs: 3600,
        }
    }

    #[tokio::test]
    async fn test_emit_event() {
        let (handle, mut rx) = AuditHandle::channel(10);

        handle.emit(submitted("req-1")).await;

        let envelope = rx.recv().await.expect("Should receive event");
        assert_eq!(envelope.event.request_id(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_cloned_handles_share_channel() {
        let (handle, mut rx) = AuditHandle::channel(10);
        let clone = handle.clone();

        handle.emit(submitted("req-1")).await;
        clone
            .emit(AuditEvent::TransitionRejected {
                request_id: "req-1".to_string(),
                current_state: "ISSUED".to_string(),
                attempted_event: "issuance_succeeded".to_string(),
            })
            .await;

        let first = rx.recv().await.expect("Should receive first event");
        let second = rx.recv().await.expect("Should receive second event");
        assert_eq!(first.event.event_type(), "request_submitted");
        assert_eq!(second.event.event_type(), "transition_rejected");
    }

    #[test]
    fn test_try_emit_full_channel() {
        let (handle, _rx) = AuditHandle::channel(1);

        assert!(handle.try_emit(submitted("req-1")));
        assert!(!handle.try_emit(submitted("req-2")));
    }

    #[tokio::test]
    async fn test_emit_after_writer_gone() {
        let (handle, rx) = AuditHandle::channel(10);
        drop(rx);

        assert!(handle.is_closed());
        // Logged, not propagated
        handle.emit(submitted("req-1")).await;
    }

    #[test]
    fn test_envelope_has_timestamp() {
        let (handle, mut rx) = AuditHandle::channel(10);

        let before = Utc::now();
        handle.try_emit(submitted("req-1"));
        let after = Utc::now();

        let envelope = rx.try_recv().expect("Should receive event");
        assert!(envelope.timestamp >= before);
        assert!(envelope.timestamp <= after);
    }
}

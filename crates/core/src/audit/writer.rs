use std::sync::Arc;

use tokio::sync::mpsc;

use super::{AuditEventEnvelope, AuditHandle, AuditRecord, AuditStore};

/// Background task that drains the audit channel into storage.
pub struct AuditWriter {
    rx: mpsc::Receiver<AuditEventEnvelope>,
    store: Arc<dyn AuditStore>,
}

impl AuditWriter {
    pub fn new(rx: mpsc::Receiver<AuditEventEnvelope>, store: Arc<dyn AuditStore>) -> Self {
        Self { rx, store }
    }

    /// Consume events until every [`AuditHandle`] has been dropped.
    ///
    /// A failed insert is logged and skipped; the writer keeps running.
    pub async fn run(mut self) {
        tracing::info!("Audit writer started");
        let mut written: u64 = 0;

        while let Some(envelope) = self.rx.recv().await {
            let record = AuditRecord {
                id: 0,
                timestamp: envelope.timestamp,
                event_type: envelope.event.event_type().to_string(),
                request_id: envelope.event.request_id().map(String::from),
                user_id: envelope.event.user_id().map(String::from),
                data: envelope.event,
            };

            match self.store.insert(&record) {
                Ok(_) => written += 1,
                Err(e) => tracing::error!(
                    event_type = %record.event_type,
                    request_id = ?record.request_id,
                    "Failed to write audit event: {}",
                    e
                ),
            }
        }

        tracing::info!(written, "Audit writer shutting down");
    }
}

/// Create a connected handle and writer.
///
/// Spawn the writer with `tokio::spawn(writer.run())` and clone the handle
/// into each component. `buffer_size` bounds the channel; `emit` waits when
/// it is full.
pub fn create_audit_system(
    store: Arc<dyn AuditStore>,
    buffer_size: usize,
) -> (AuditHandle, AuditWriter) {
    let (handle, rx) = AuditHandle::channel(buffer_size);
    let writer = AuditWriter::new(rx, store);
    (handle, writer)
}

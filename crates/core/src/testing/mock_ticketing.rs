//! Mock ticketing system for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::backend::BackendError;
use crate::ticketing::{TicketRecord, TicketSpec, TicketStatus, TicketUpdate, TicketingSystem};

/// Mock implementation of the TicketingSystem trait.
///
/// Tickets are numbered `TCK-1001`, `TCK-1002`, ... and start with the
/// status carried by their spec. Failures are queued per operation and
/// consumed one per call.
pub struct MockTicketingSystem {
    tickets: Arc<RwLock<Vec<TicketRecord>>>,
    specs: Arc<RwLock<Vec<TicketSpec>>>,
    updates: Arc<RwLock<Vec<(String, TicketUpdate)>>>,
    create_failures: Arc<RwLock<VecDeque<BackendError>>>,
    update_failures: Arc<RwLock<VecDeque<BackendError>>>,
    /// Create the next ticket but report the call as failed.
    lose_next_create: Arc<RwLock<bool>>,
    create_calls: Arc<RwLock<usize>>,
    delay: Arc<RwLock<Option<Duration>>>,
    next_id: AtomicU32,
}

impl std::fmt::Debug for MockTicketingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTicketingSystem")
            .field("tickets", &"<tickets>")
            .field("updates", &"<updates>")
            .field("create_failures", &"<failures>")
            .finish()
    }
}

impl Default for MockTicketingSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTicketingSystem {
    pub fn new() -> Self {
        Self {
            tickets: Arc::new(RwLock::new(Vec::new())),
            specs: Arc::new(RwLock::new(Vec::new())),
            updates: Arc::new(RwLock::new(Vec::new())),
            create_failures: Arc::new(RwLock::new(VecDeque::new())),
            update_failures: Arc::new(RwLock::new(VecDeque::new())),
            lose_next_create: Arc::new(RwLock::new(false)),
            create_calls: Arc::new(RwLock::new(0)),
            delay: Arc::new(RwLock::new(None)),
            next_id: AtomicU32::new(1001),
        }
    }

    pub async fn push_create_failure(&self, error: BackendError) {
        self.create_failures.write().await.push_back(error);
    }

    pub async fn push_update_failure(&self, error: BackendError) {
        self.update_failures.write().await.push_back(error);
    }

    /// The next create call stores the ticket, then fails as if the
    /// response never arrived.
    pub async fn lose_next_create_response(&self) {
        *self.lose_next_create.write().await = true;
    }

    /// Change a ticket's status as an operator would, without recording an update.
    pub async fn set_remote_status(&self, ticket_id: &str, status: TicketStatus) {
        if let Some(ticket) = self
            .tickets
            .write()
            .await
            .iter_mut()
            .find(|t| t.ticket_id == ticket_id)
        {
            ticket.status = status;
        }
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }

    pub async fn ticket(&self, ticket_id: &str) -> Option<TicketRecord> {
        self.tickets
            .read()
            .await
            .iter()
            .find(|t| t.ticket_id == ticket_id)
            .cloned()
    }

    pub async fn tickets(&self) -> Vec<TicketRecord> {
        self.tickets.read().await.clone()
    }

    /// Specs of the tickets actually created.
    pub async fn specs(&self) -> Vec<TicketSpec> {
        self.specs.read().await.clone()
    }

    pub async fn updates(&self) -> Vec<(String, TicketUpdate)> {
        self.updates.read().await.clone()
    }

    /// Number of create calls, including failed ones.
    pub async fn create_count(&self) -> usize {
        *self.create_calls.read().await
    }

    async fn wait(&self) {
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl TicketingSystem for MockTicketingSystem {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_ticket(&self, spec: &TicketSpec) -> Result<TicketRecord, BackendError> {
        *self.create_calls.write().await += 1;
        self.wait().await;

        if let Some(error) = self.create_failures.write().await.pop_front() {
            return Err(error);
        }

        let ticket = TicketRecord {
            ticket_id: format!("TCK-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            status: spec.status,
            correlation_id: Some(spec.correlation_id.clone()),
        };
        self.tickets.write().await.push(ticket.clone());
        self.specs.write().await.push(spec.clone());

        let mut lose = self.lose_next_create.write().await;
        if *lose {
            *lose = false;
            return Err(BackendError::transient("connection reset before response"));
        }
        Ok(ticket)
    }

    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<TicketRecord>, BackendError> {
        self.wait().await;
        Ok(self
            .tickets
            .read()
            .await
            .iter()
            .find(|t| t.correlation_id.as_deref() == Some(correlation_id))
            .cloned())
    }

    async fn get_ticket(&self, ticket_id: &str) -> Result<TicketRecord, BackendError> {
        self.wait().await;
        self.ticket(ticket_id)
            .await
            .ok_or_else(|| BackendError::permanent(format!("ticket {} not found", ticket_id)))
    }

    async fn update_ticket(
        &self,
        ticket_id: &str,
        update: &TicketUpdate,
    ) -> Result<TicketRecord, BackendError> {
        self.wait().await;

        if let Some(error) = self.update_failures.write().await.pop_front() {
            return Err(error);
        }

        let mut tickets = self.tickets.write().await;
        let ticket = tickets
            .iter_mut()
            .find(|t| t.ticket_id == ticket_id)
            .ok_or_else(|| BackendError::permanent(format!("ticket {} not found", ticket_id)))?;
        ticket.status = update.status;
        let updated = ticket.clone();
        drop(tickets);

        self.updates
            .write()
            .await
            .push((ticket_id.to_string(), update.clone()));
        Ok(updated)
    }
}

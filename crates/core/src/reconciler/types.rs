//! Types reported by the ticket reconciler.

use serde::Serialize;

use crate::lifecycle::RequestState;
use crate::ticketing::TicketStatus;

/// Something one reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileAction {
    /// A new ticket was created.
    Created { ticket_id: String },
    /// A ticket carrying this request's correlation id already existed.
    Adopted { ticket_id: String },
    /// The ticket status now matches the issuance facet.
    Synced {
        ticket_id: String,
        status: TicketStatus,
    },
    /// Ticket creation gave up; the ticket facet is now failed.
    CreationFailed { reason: String, attempts: u32 },
    /// Fetching or updating the ticket failed; a later pass retries.
    UpdateFailed { ticket_id: String, reason: String },
    /// A pass was already running; it will go around once more.
    Deferred,
}

/// Disagreement between the two facets, or between the ticket and its
/// last known status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Divergence {
    /// The ticket shows approval but issuance never ran.
    ApprovedWithoutIssuance,
    /// A certificate exists but its ticket was never confirmed.
    IssuedWithoutTicket,
    /// The remote status changed away from what was last synced.
    StatusDrift {
        expected: TicketStatus,
        found: TicketStatus,
    },
}

impl Divergence {
    pub fn kind(&self) -> &'static str {
        match self {
            Divergence::ApprovedWithoutIssuance => "approved_without_issuance",
            Divergence::IssuedWithoutTicket => "issued_without_ticket",
            Divergence::StatusDrift { .. } => "status_drift",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Divergence::ApprovedWithoutIssuance => {
                "ticket is approved but issuance has not started".to_string()
            }
            Divergence::IssuedWithoutTicket => {
                "certificate issued while ticket creation is still pending".to_string()
            }
            Divergence::StatusDrift { expected, found } => {
                format!("ticket status is {} but {} was last synced", found, expected)
            }
        }
    }
}

/// Result of [`super::TicketReconciler::reconcile`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub request_id: String,
    /// Composite state after the pass.
    pub state: RequestState,
    pub ticket_id: Option<String>,
    pub actions: Vec<ReconcileAction>,
    pub divergences: Vec<Divergence>,
}

impl ReconcileOutcome {
    pub(crate) fn new(request_id: &str, state: RequestState) -> Self {
        Self {
            request_id: request_id.to_string(),
            state,
            ticket_id: None,
            actions: Vec::new(),
            divergences: Vec::new(),
        }
    }

    /// Whether the issuance side lags and should be re-driven.
    pub fn needs_issuance(&self) -> bool {
        self.divergences
            .contains(&Divergence::ApprovedWithoutIssuance)
    }

    pub fn was_deferred(&self) -> bool {
        self.actions == [ReconcileAction::Deferred]
    }
}

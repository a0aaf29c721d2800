//! Ticket reconciler: the ticketing facet of the lifecycle.

mod ticket;
mod types;

pub use ticket::TicketReconciler;
pub use types::{Divergence, ReconcileAction, ReconcileOutcome};

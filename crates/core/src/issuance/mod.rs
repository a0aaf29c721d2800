//! Issuance coordinator: the PKI facet of the lifecycle.

mod coordinator;

pub use coordinator::{IssuanceCoordinator, IssuanceOutcome};

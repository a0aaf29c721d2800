//! Certificate orchestrator for automated request processing.
//!
//! The orchestrator drives each request through both external systems:
//! - **Issuance**: one PKI call sequence per request, retried with backoff
//! - **Ticketing**: reconciled independently of issuance, coalesced per request
//! - **Sweep**: periodic expiry marking and recovery of interrupted work

mod config;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use runner::CertificateOrchestrator;
pub use types::{OrchestratorStatus, RevokeError, SubmitError, SweepReport};

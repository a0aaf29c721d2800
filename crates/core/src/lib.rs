pub mod audit;
pub mod backend;
pub mod config;
mod inflight;
pub mod issuance;
pub mod lifecycle;
pub mod metrics;
pub mod orchestrator;
pub mod pki;
pub mod query;
pub mod reconciler;
pub mod request;
pub mod retry;
pub mod testing;
pub mod ticketing;

pub use audit::{
    create_audit_system, AuditError, AuditEvent, AuditEventEnvelope, AuditFilter, AuditHandle,
    AuditRecord, AuditStore, AuditWriter, SqliteAuditStore,
};
pub use backend::BackendError;
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use issuance::{IssuanceCoordinator, IssuanceOutcome};
pub use lifecycle::{
    HistoryEntry, IssuanceFacet, LifecycleError, LifecycleEvent, LifecycleStore, RecordFilter, RecordStore,
    RequestState, SqliteRecordStore, TicketFacet,
};
pub use orchestrator::{
    CertificateOrchestrator, OrchestratorConfig, OrchestratorStatus, RevokeError, SubmitError,
    SweepReport,
};
pub use pki::{IssuedCertificate, PkiEngine, VaultPkiClient};
pub use query::{NotFoundError, QueryError, StatusQuery};
pub use reconciler::{Divergence, ReconcileAction, ReconcileOutcome, TicketReconciler};
pub use request::{
    CertificateRequest, RawCertificateRequest, RequestValidator, ValidationError,
};
pub use retry::{RetryError, RetryPolicy};
pub use ticketing::{ServiceNowClient, TicketStatus, TicketingSystem};

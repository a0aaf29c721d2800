use std::sync::Arc;

use certflow_core::{AuditHandle, AuditStore, CertificateOrchestrator, Config, SanitizedConfig};

/// Shared application state
pub struct AppState {
    config: Config,
    audit: AuditHandle,
    audit_store: Arc<dyn AuditStore>,
    orchestrator: Arc<CertificateOrchestrator>,
}

impl AppState {
    pub fn new(
        config: Config,
        audit: AuditHandle,
        audit_store: Arc<dyn AuditStore>,
        orchestrator: Arc<CertificateOrchestrator>,
    ) -> Self {
        Self {
            config,
            audit,
            audit_store,
            orchestrator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn audit(&self) -> &AuditHandle {
        &self.audit
    }

    pub fn audit_store(&self) -> &Arc<dyn AuditStore> {
        &self.audit_store
    }

    pub fn orchestrator(&self) -> &Arc<CertificateOrchestrator> {
        &self.orchestrator
    }
}

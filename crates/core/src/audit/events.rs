use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    // System events
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },

    // Intake
    RequestSubmitted {
        request_id: String,
        requester: String,
        subject_name: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        alt_names: Vec<String>,
        ttl_secs: u64,
    },
    RequestRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requester: Option<String>,
        field: String,
        reason: String,
    },

    // Lifecycle store
    RequestStateChanged {
        request_id: String,
        from_state: String,
        to_state: String,
        /// Lifecycle event that caused the change (e.g. "ticket_created")
        event: String,
        cause: Option<String>,
    },
    /// An out-of-order or duplicate event was refused.
    TransitionRejected {
        request_id: String,
        current_state: String,
        attempted_event: String,
    },

    // Issuance
    CertificateIssued {
        request_id: String,
        serial_number: String,
        expires_at: DateTime<Utc>,
        attempts: u32,
    },
    IssuanceFailed {
        request_id: String,
        reason: String,
        /// True when the PKI rejected the request outright
        permanent: bool,
        attempts: u32,
    },

    // Ticketing
    TicketCreated {
        request_id: String,
        ticket_id: String,
        /// True when an existing ticket was found by correlation id
        adopted: bool,
    },
    TicketCreationFailed {
        request_id: String,
        reason: String,
        attempts: u32,
    },
    TicketSynced {
        request_id: String,
        ticket_id: String,
        status: String,
    },
    TicketUpdateFailed {
        request_id: String,
        ticket_id: String,
        reason: String,
    },
    DivergenceDetected {
        request_id: String,
        kind: String,
        detail: String,
    },

    // End of life
    CertificateRevoked {
        request_id: String,
        serial_number: String,
        revoked_by: String,
        reason: Option<String>,
    },
    CertificateExpired {
        request_id: String,
        serial_number: String,
    },
    /// A successor request was submitted for a certificate close to expiry.
    CertificateRotated {
        request_id: String,
        successor_id: String,
        serial_number: String,
        expires_at: DateTime<Utc>,
    },
    /// The PKI issued a certificate that could not be recorded.
    CertificateOrphaned {
        request_id: String,
        serial_number: String,
        reason: String,
    },
}

impl AuditEvent {
    /// Returns the event type as a string for storage
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::RequestSubmitted { .. } => "request_submitted",
            Self::RequestRejected { .. } => "request_rejected",
            Self::RequestStateChanged { .. } => "request_state_changed",
            Self::TransitionRejected { .. } => "transition_rejected",
            Self::CertificateIssued { .. } => "certificate_issued",
            Self::IssuanceFailed { .. } => "issuance_failed",
            Self::TicketCreated { .. } => "ticket_created",
            Self::TicketCreationFailed { .. } => "ticket_creation_failed",
            Self::TicketSynced { .. } => "ticket_synced",
            Self::TicketUpdateFailed { .. } => "ticket_update_failed",
            Self::DivergenceDetected { .. } => "divergence_detected",
            Self::CertificateRevoked { .. } => "certificate_revoked",
            Self::CertificateExpired { .. } => "certificate_expired",
            Self::CertificateRotated { .. } => "certificate_rotated",
            Self::CertificateOrphaned { .. } => "certificate_orphaned",
        }
    }

    /// Extract request_id if this event concerns a single request
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::RequestSubmitted { request_id, .. }
            | Self::RequestStateChanged { request_id, .. }
            | Self::TransitionRejected { request_id, .. }
            | Self::CertificateIssued { request_id, .. }
            | Self::IssuanceFailed { request_id, .. }
            | Self::TicketCreated { request_id, .. }
            | Self::TicketCreationFailed { request_id, .. }
            | Self::TicketSynced { request_id, .. }
            | Self::TicketUpdateFailed { request_id, .. }
            | Self::DivergenceDetected { request_id, .. }
            | Self::CertificateRevoked { request_id, .. }
            | Self::CertificateExpired { request_id, .. }
            | Self::CertificateRotated { request_id, .. }
            | Self::CertificateOrphaned { request_id, .. } => Some(request_id),
            Self::ServiceStarted { .. }
            | Self::ServiceStopped { .. }
            | Self::RequestRejected { .. } => None,
        }
    }

    /// Extract the acting user if this event was user-initiated
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::RequestSubmitted { requester, .. } => Some(requester),
            Self::RequestRejected { requester, .. } => requester.as_deref(),
            Self::CertificateRevoked { revoked_by, .. } => Some(revoked_by),
            _ => None,
        }
    }
}

/// A stored audit record with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub data: AuditEvent,
}

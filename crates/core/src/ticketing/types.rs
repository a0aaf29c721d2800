use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::BackendError;
use crate::lifecycle::IssuanceFacet;
use crate::request::CertificateRequest;

/// Status field of a ticket in the ticketing system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Approved,
    InProgress,
    Issued,
    Failed,
    Expired,
    Revoked,
    /// Any value this service does not manage.
    #[serde(other)]
    Unknown,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Approved => "approved",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Issued => "issued",
            TicketStatus::Failed => "failed",
            TicketStatus::Expired => "expired",
            TicketStatus::Revoked => "revoked",
            TicketStatus::Unknown => "unknown",
        }
    }

    /// Parse a remote status value; unmanaged values map to `Unknown`.
    pub fn parse_remote(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace(' ', "_").replace('-', "_").as_str() {
            "open" | "new" => TicketStatus::Open,
            "approved" => TicketStatus::Approved,
            "in_progress" => TicketStatus::InProgress,
            "issued" => TicketStatus::Issued,
            "failed" => TicketStatus::Failed,
            "expired" => TicketStatus::Expired,
            "revoked" => TicketStatus::Revoked,
            _ => TicketStatus::Unknown,
        }
    }

    /// Status the ticket should show for the given issuance facet.
    pub fn desired_for(issuance: &IssuanceFacet) -> Self {
        match issuance {
            IssuanceFacet::Pending => TicketStatus::Open,
            IssuanceFacet::Issuing { .. } => TicketStatus::InProgress,
            IssuanceFacet::Issued { .. } => TicketStatus::Issued,
            IssuanceFacet::Failed { .. } => TicketStatus::Failed,
            IssuanceFacet::Expired { .. } => TicketStatus::Expired,
            IssuanceFacet::Revoked { .. } => TicketStatus::Revoked,
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of a new ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketSpec {
    /// The request id; used to find a ticket whose creation response was lost.
    pub correlation_id: String,
    pub short_description: String,
    pub description: String,
    pub common_name: String,
    pub requester: String,
    pub status: TicketStatus,
}

impl From<&CertificateRequest> for TicketSpec {
    fn from(record: &CertificateRequest) -> Self {
        let requested = &record.requested;
        let mut description = format!(
            "Certificate request {} for {}\nRequested by: {}\nTTL: {}s\nKey usage: {}",
            record.id,
            requested.subject_name,
            record.requester,
            requested.ttl_secs,
            requested
                .key_usage
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        if !requested.subject_alt_names.is_empty() {
            description.push_str(&format!(
                "\nSubject alternative names: {}",
                requested.subject_alt_names.join(", ")
            ));
        }
        if let Some(note) = status_note(&record.issuance) {
            description.push('\n');
            description.push_str(&note);
        }

        Self {
            correlation_id: record.id.clone(),
            short_description: format!("Certificate request: {}", requested.subject_name),
            description,
            common_name: crate::request::common_name(&requested.subject_name).to_string(),
            requester: record.requester.clone(),
            status: TicketStatus::desired_for(&record.issuance),
        }
    }
}

/// Work note describing the issuance facet, for ticket descriptions and
/// status updates.
pub fn status_note(issuance: &IssuanceFacet) -> Option<String> {
    match issuance {
        IssuanceFacet::Pending => None,
        IssuanceFacet::Issuing { .. } => Some("Issuance in progress".to_string()),
        IssuanceFacet::Issued { certificate } => Some(format!(
            "Certificate issued: serial {}, expires {}",
            certificate.serial_number,
            certificate.expires_at.to_rfc3339()
        )),
        IssuanceFacet::Failed {
            reason,
            permanent,
            attempts,
            ..
        } => Some(if *permanent {
            format!("Issuance rejected by PKI: {}", reason)
        } else {
            format!("Issuance failed after {} attempt(s): {}", attempts, reason)
        }),
        IssuanceFacet::Expired { certificate, .. } => Some(format!(
            "Certificate {} expired at {}",
            certificate.serial_number,
            certificate.expires_at.to_rfc3339()
        )),
        IssuanceFacet::Revoked {
            certificate,
            revoked_by,
            reason,
            ..
        } => Some(match reason {
            Some(reason) => format!(
                "Certificate {} revoked by {}: {}",
                certificate.serial_number, revoked_by, reason
            ),
            None => format!(
                "Certificate {} revoked by {}",
                certificate.serial_number, revoked_by
            ),
        }),
    }
}

/// A ticket as seen in the ticketing system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketRecord {
    pub ticket_id: String,
    pub status: TicketStatus,
    pub correlation_id: Option<String>,
}

/// Status change pushed to an existing ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketUpdate {
    pub status: TicketStatus,
    /// Work note explaining the change (e.g. the PKI failure reason).
    pub note: Option<String>,
}

/// Ticket tracking backend.
#[async_trait]
pub trait TicketingSystem: Send + Sync {
    /// Backend name for logs and metrics (e.g. "servicenow").
    fn name(&self) -> &str;

    async fn create_ticket(&self, spec: &TicketSpec) -> Result<TicketRecord, BackendError>;

    /// Find the ticket carrying the given correlation id, if one exists.
    async fn find_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Option<TicketRecord>, BackendError>;

    async fn get_ticket(&self, ticket_id: &str) -> Result<TicketRecord, BackendError>;

    async fn update_ticket(
        &self,
        ticket_id: &str,
        update: &TicketUpdate,
    ) -> Result<TicketRecord, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use chrono::Utc;

    #[test]
    fn test_desired_status_tracks_issuance() {
        let now = Utc::now();
        assert_eq!(
            TicketStatus::desired_for(&IssuanceFacet::Pending),
            TicketStatus::Open
        );
        assert_eq!(
            TicketStatus::desired_for(&IssuanceFacet::Issuing { started_at: now }),
            TicketStatus::InProgress
        );
        assert_eq!(
            TicketStatus::desired_for(&IssuanceFacet::Failed {
                reason: "no".to_string(),
                permanent: true,
                attempts: 1,
                failed_at: now,
            }),
            TicketStatus::Failed
        );
    }

    #[test]
    fn test_parse_remote_status() {
        assert_eq!(TicketStatus::parse_remote("Approved"), TicketStatus::Approved);
        assert_eq!(TicketStatus::parse_remote("in progress"), TicketStatus::InProgress);
        assert_eq!(TicketStatus::parse_remote("new"), TicketStatus::Open);
        assert_eq!(TicketStatus::parse_remote("on_hold"), TicketStatus::Unknown);

        let parsed: TicketStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(parsed, TicketStatus::Unknown);
    }

    #[test]
    fn test_spec_from_request() {
        let mut record = fixtures::pending_request("svc.example.com");
        record.requested.subject_alt_names = vec!["api.example.com".to_string()];

        let spec = TicketSpec::from(&record);
        assert_eq!(spec.correlation_id, record.id);
        assert_eq!(spec.common_name, "svc.example.com");
        assert_eq!(spec.status, TicketStatus::Open);
        assert!(spec.short_description.contains("svc.example.com"));
        assert!(spec.description.contains("api.example.com"));
    }

    #[test]
    fn test_spec_carries_failure_reason() {
        let mut record = fixtures::pending_request("svc.example.com");
        record.issuance = IssuanceFacet::Failed {
            reason: "name not permitted".to_string(),
            permanent: true,
            attempts: 1,
            failed_at: Utc::now(),
        };

        let spec = TicketSpec::from(&record);
        assert_eq!(spec.status, TicketStatus::Failed);
        assert!(spec.description.contains("name not permitted"));
    }
}

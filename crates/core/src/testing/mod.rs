//! Testing utilities and mock implementations of the backend traits.
//!
//! The mocks let the orchestrator run end to end without Vault or
//! ServiceNow.
//!
//! # Example
//!
//! ```rust,ignore
//! use certflow_core::testing::{MockPkiEngine, MockTicketingSystem};
//!
//! let pki = MockPkiEngine::new();
//! let ticketing = MockTicketingSystem::new();
//!
//! // Configure mock behavior
//! pki.set_serials(vec!["AA:BB:CC:01"]).await;
//! ticketing.lose_next_create_response().await;
//! ```

mod mock_pki;
mod mock_ticketing;

pub use mock_pki::{MockPkiEngine, RecordedIssue};
pub use mock_ticketing::MockTicketingSystem;

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::{Duration, Utc};

    use crate::lifecycle::{apply_event, LifecycleEvent};
    use crate::pki::IssuedCertificate;
    use crate::request::{CertificateRequest, KeyUsage, RequestedCertificate, SubjectAttributes};

    /// A certificate valid for 30 days from now.
    pub fn issued_certificate(serial: &str) -> IssuedCertificate {
        let issued_at = Utc::now();
        IssuedCertificate {
            serial_number: serial.to_string(),
            certificate_pem: format!(
                "-----BEGIN CERTIFICATE-----\nMOCK {}\n-----END CERTIFICATE-----\n",
                serial
            ),
            issued_at,
            expires_at: issued_at + Duration::days(30),
        }
    }

    /// A freshly submitted request for `subject` by "alice", valid for 24h.
    pub fn pending_request(subject: &str) -> CertificateRequest {
        CertificateRequest::new_pending(
            uuid::Uuid::new_v4().to_string(),
            "alice",
            RequestedCertificate {
                subject_name: subject.to_string(),
                subject: SubjectAttributes::default(),
                subject_alt_names: Vec::new(),
                ttl_secs: 24 * 3600,
                key_usage: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
            },
            Utc::now(),
        )
    }

    /// Issued with ticket `TCK-1001` created; the ticket status is not yet synced.
    pub fn issued_request(subject: &str, serial: &str) -> CertificateRequest {
        issued_request_from(pending_request(subject), serial)
    }

    /// Drive `record` from pending to issued with ticket `TCK-1001`.
    pub fn issued_request_from(record: CertificateRequest, serial: &str) -> CertificateRequest {
        let record = awaiting_ticket_from(record, serial);
        apply(
            &record,
            LifecycleEvent::TicketCreated {
                ticket_id: "TCK-1001".to_string(),
            },
        )
    }

    /// Certificate issued, ticket creation still pending.
    pub fn awaiting_ticket_request(subject: &str, serial: &str) -> CertificateRequest {
        awaiting_ticket_from(pending_request(subject), serial)
    }

    fn awaiting_ticket_from(record: CertificateRequest, serial: &str) -> CertificateRequest {
        let record = apply(&record, LifecycleEvent::IssuanceStarted);
        apply(
            &record,
            LifecycleEvent::IssuanceSucceeded {
                certificate: issued_certificate(serial),
            },
        )
    }

    fn apply(record: &CertificateRequest, event: LifecycleEvent) -> CertificateRequest {
        match apply_event(record, &event, Utc::now()) {
            Ok(next) => next,
            Err(e) => panic!("fixture transition failed: {}", e),
        }
    }
}

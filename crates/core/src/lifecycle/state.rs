//! Lifecycle state machine.
//!
//! A request carries two independent facets, one per external backend. Events
//! move a single facet along its own edges; the composite [`RequestState`] is
//! then recomputed by [`merge`] and checked against the composite edge table.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pki::IssuedCertificate;
use crate::request::CertificateRequest;
use crate::ticketing::TicketStatus;

/// Composite, externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Pending,
    Issuing,
    AwaitingTicket,
    Issued,
    TicketFailed,
    IssuanceFailed,
    Expired,
    Revoked,
}

impl RequestState {
    pub const ALL: [RequestState; 8] = [
        RequestState::Pending,
        RequestState::Issuing,
        RequestState::AwaitingTicket,
        RequestState::Issued,
        RequestState::TicketFailed,
        RequestState::IssuanceFailed,
        RequestState::Expired,
        RequestState::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "PENDING",
            RequestState::Issuing => "ISSUING",
            RequestState::AwaitingTicket => "AWAITING_TICKET",
            RequestState::Issued => "ISSUED",
            RequestState::TicketFailed => "TICKET_FAILED",
            RequestState::IssuanceFailed => "ISSUANCE_FAILED",
            RequestState::Expired => "EXPIRED",
            RequestState::Revoked => "REVOKED",
        }
    }

    /// States in which the certificate serial and PEM are exposed.
    pub fn exposes_certificate(&self) -> bool {
        matches!(
            self,
            RequestState::Issued | RequestState::Expired | RequestState::Revoked
        )
    }

    /// States with no outgoing edges other than self-loops.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            RequestState::IssuanceFailed | RequestState::Expired | RequestState::Revoked
        )
    }

    /// Composite edge table. Self-loops are always allowed so that facet
    /// updates which do not change the composite are still recorded.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;

        if *self == next {
            return true;
        }

        matches!(
            (self, next),
            (Pending, Issuing)
                | (Pending, TicketFailed)
                | (Issuing, AwaitingTicket)
                | (Issuing, Issued)
                | (Issuing, IssuanceFailed)
                | (Issuing, TicketFailed)
                | (AwaitingTicket, Issued)
                | (AwaitingTicket, TicketFailed)
                | (AwaitingTicket, Expired)
                | (AwaitingTicket, Revoked)
                | (Issued, Expired)
                | (Issued, Revoked)
                | (TicketFailed, IssuanceFailed)
                | (TicketFailed, Expired)
                | (TicketFailed, Revoked)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        RequestState::ALL
            .iter()
            .find(|state| state.as_str() == wanted)
            .copied()
            .ok_or_else(|| format!("unknown request state '{}'", s))
    }
}

/// Progress of the PKI side of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IssuanceFacet {
    Pending,
    Issuing {
        started_at: DateTime<Utc>,
    },
    Issued {
        certificate: IssuedCertificate,
    },
    Failed {
        reason: String,
        permanent: bool,
        attempts: u32,
        failed_at: DateTime<Utc>,
    },
    Expired {
        certificate: IssuedCertificate,
        expired_at: DateTime<Utc>,
    },
    Revoked {
        certificate: IssuedCertificate,
        revoked_at: DateTime<Utc>,
        revoked_by: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl IssuanceFacet {
    pub fn status_name(&self) -> &'static str {
        match self {
            IssuanceFacet::Pending => "pending",
            IssuanceFacet::Issuing { .. } => "issuing",
            IssuanceFacet::Issued { .. } => "issued",
            IssuanceFacet::Failed { .. } => "failed",
            IssuanceFacet::Expired { .. } => "expired",
            IssuanceFacet::Revoked { .. } => "revoked",
        }
    }

    /// Certificate material, retained once issued regardless of later states.
    pub fn certificate(&self) -> Option<&IssuedCertificate> {
        match self {
            IssuanceFacet::Issued { certificate }
            | IssuanceFacet::Expired { certificate, .. }
            | IssuanceFacet::Revoked { certificate, .. } => Some(certificate),
            _ => None,
        }
    }

    /// Whether issuance has reached an outcome and must not be re-driven.
    pub fn is_settled(&self) -> bool {
        !matches!(
            self,
            IssuanceFacet::Pending | IssuanceFacet::Issuing { .. }
        )
    }
}

/// Progress of the ticketing side of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TicketFacet {
    Pending,
    Created {
        ticket_id: String,
        created_at: DateTime<Utc>,
        /// Last status this service confirmed on the remote ticket.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        synced_status: Option<TicketStatus>,
    },
    Failed {
        reason: String,
        attempts: u32,
        failed_at: DateTime<Utc>,
    },
}

impl TicketFacet {
    pub fn status_name(&self) -> &'static str {
        match self {
            TicketFacet::Pending => "pending",
            TicketFacet::Created { .. } => "created",
            TicketFacet::Failed { .. } => "failed",
        }
    }

    pub fn ticket_id(&self) -> Option<&str> {
        match self {
            TicketFacet::Created { ticket_id, .. } => Some(ticket_id),
            _ => None,
        }
    }

    pub fn synced_status(&self) -> Option<TicketStatus> {
        match self {
            TicketFacet::Created { synced_status, .. } => *synced_status,
            _ => None,
        }
    }
}

/// Outcome reports fed into the lifecycle store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    IssuanceStarted,
    IssuanceSucceeded {
        certificate: IssuedCertificate,
    },
    IssuanceFailed {
        reason: String,
        permanent: bool,
        attempts: u32,
    },
    TicketCreated {
        ticket_id: String,
    },
    TicketFailed {
        reason: String,
        attempts: u32,
    },
    TicketStatusSynced {
        status: TicketStatus,
    },
    Expired,
    Revoked {
        revoked_by: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::IssuanceStarted => "issuance_started",
            LifecycleEvent::IssuanceSucceeded { .. } => "issuance_succeeded",
            LifecycleEvent::IssuanceFailed { .. } => "issuance_failed",
            LifecycleEvent::TicketCreated { .. } => "ticket_created",
            LifecycleEvent::TicketFailed { .. } => "ticket_failed",
            LifecycleEvent::TicketStatusSynced { .. } => "ticket_status_synced",
            LifecycleEvent::Expired => "expired",
            LifecycleEvent::Revoked { .. } => "revoked",
        }
    }

    /// Human readable cause recorded in the history entry.
    pub fn cause(&self) -> Option<String> {
        match self {
            LifecycleEvent::IssuanceStarted => None,
            LifecycleEvent::IssuanceSucceeded { certificate } => {
                Some(format!("issued serial {}", certificate.serial_number))
            }
            LifecycleEvent::IssuanceFailed {
                reason,
                permanent,
                attempts,
            } => Some(if *permanent {
                format!("rejected by PKI: {}", reason)
            } else {
                format!("PKI unavailable after {} attempt(s): {}", attempts, reason)
            }),
            LifecycleEvent::TicketCreated { ticket_id } => Some(format!("ticket {}", ticket_id)),
            LifecycleEvent::TicketFailed { reason, attempts } => Some(format!(
                "ticket creation failed after {} attempt(s): {}",
                attempts, reason
            )),
            LifecycleEvent::TicketStatusSynced { status } => {
                Some(format!("ticket status {}", status))
            }
            LifecycleEvent::Expired => Some("certificate validity ended".to_string()),
            LifecycleEvent::Revoked { revoked_by, reason } => Some(match reason {
                Some(reason) => format!("revoked by {}: {}", revoked_by, reason),
                None => format!("revoked by {}", revoked_by),
            }),
        }
    }
}

/// One append-only history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    /// `None` only for the initial `PENDING` entry.
    pub from: Option<RequestState>,
    pub to: RequestState,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl HistoryEntry {
    pub fn submitted(at: DateTime<Utc>) -> Self {
        Self {
            at,
            from: None,
            to: RequestState::Pending,
            event: "submitted".to_string(),
            cause: None,
        }
    }
}

/// An event that does not correspond to a valid edge from the current state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot apply {attempted_event} to request {request_id} in state {current_state}")]
pub struct TransitionError {
    pub request_id: String,
    pub current_state: RequestState,
    pub attempted_event: String,
}

/// Compute the composite state from both facets.
///
/// Terminal outcomes on either facet dominate; a request is `ISSUED` only when
/// the certificate exists and the ticket has been confirmed.
pub fn merge(issuance: &IssuanceFacet, ticket: &TicketFacet) -> RequestState {
    match (issuance, ticket) {
        (IssuanceFacet::Failed { .. }, _) => RequestState::IssuanceFailed,
        (IssuanceFacet::Revoked { .. }, _) => RequestState::Revoked,
        (IssuanceFacet::Expired { .. }, _) => RequestState::Expired,
        (_, TicketFacet::Failed { .. }) => RequestState::TicketFailed,
        (IssuanceFacet::Issued { .. }, TicketFacet::Created { .. }) => RequestState::Issued,
        (IssuanceFacet::Issued { .. }, TicketFacet::Pending) => RequestState::AwaitingTicket,
        (IssuanceFacet::Issuing { .. }, _) => RequestState::Issuing,
        (IssuanceFacet::Pending, _) => RequestState::Pending,
    }
}

/// Move one facet along its own edge, or `None` if the event does not apply.
fn advance_facets(
    issuance: &IssuanceFacet,
    ticket: &TicketFacet,
    event: &LifecycleEvent,
    now: DateTime<Utc>,
) -> Option<(IssuanceFacet, TicketFacet)> {
    let next_issuance = match (issuance, event) {
        (IssuanceFacet::Pending, LifecycleEvent::IssuanceStarted) => {
            Some(IssuanceFacet::Issuing { started_at: now })
        }
        (IssuanceFacet::Issuing { .. }, LifecycleEvent::IssuanceSucceeded { certificate }) => {
            Some(IssuanceFacet::Issued {
                certificate: certificate.clone(),
            })
        }
        (
            IssuanceFacet::Issuing { .. },
            LifecycleEvent::IssuanceFailed {
                reason,
                permanent,
                attempts,
            },
        ) => Some(IssuanceFacet::Failed {
            reason: reason.clone(),
            permanent: *permanent,
            attempts: *attempts,
            failed_at: now,
        }),
        (IssuanceFacet::Issued { certificate }, LifecycleEvent::Expired) => {
            Some(IssuanceFacet::Expired {
                certificate: certificate.clone(),
                expired_at: now,
            })
        }
        (IssuanceFacet::Issued { certificate }, LifecycleEvent::Revoked { revoked_by, reason }) => {
            Some(IssuanceFacet::Revoked {
                certificate: certificate.clone(),
                revoked_at: now,
                revoked_by: revoked_by.clone(),
                reason: reason.clone(),
            })
        }
        _ => None,
    };

    if let Some(next_issuance) = next_issuance {
        return Some((next_issuance, ticket.clone()));
    }

    let next_ticket = match (ticket, event) {
        (TicketFacet::Pending, LifecycleEvent::TicketCreated { ticket_id }) => {
            Some(TicketFacet::Created {
                ticket_id: ticket_id.clone(),
                created_at: now,
                synced_status: None,
            })
        }
        (TicketFacet::Pending, LifecycleEvent::TicketFailed { reason, attempts }) => {
            Some(TicketFacet::Failed {
                reason: reason.clone(),
                attempts: *attempts,
                failed_at: now,
            })
        }
        (
            TicketFacet::Created {
                ticket_id,
                created_at,
                synced_status,
            },
            LifecycleEvent::TicketStatusSynced { status },
        ) if *synced_status != Some(*status) => Some(TicketFacet::Created {
            ticket_id: ticket_id.clone(),
            created_at: *created_at,
            synced_status: Some(*status),
        }),
        _ => None,
    };

    next_ticket.map(|t| (issuance.clone(), t))
}

/// Apply `event` to `record`, returning the next version of the record.
///
/// The input is never modified; a rejected event leaves no trace other than
/// the returned [`TransitionError`].
pub fn apply_event(
    record: &CertificateRequest,
    event: &LifecycleEvent,
    now: DateTime<Utc>,
) -> Result<CertificateRequest, TransitionError> {
    let reject = || TransitionError {
        request_id: record.id.clone(),
        current_state: record.state,
        attempted_event: event.kind().to_string(),
    };

    let (issuance, ticket) =
        advance_facets(&record.issuance, &record.ticket, event, now).ok_or_else(reject)?;

    let next_state = merge(&issuance, &ticket);
    if !record.state.can_transition_to(next_state) {
        return Err(reject());
    }

    let mut next = record.clone();
    next.issuance = issuance;
    next.ticket = ticket;
    next.state = next_state;
    next.updated_at = now;
    next.history.push(HistoryEntry {
        at: now,
        from: Some(record.state),
        to: next_state,
        event: event.kind().to_string(),
        cause: event.cause(),
    });

    Ok(next)
}

/// Structural invariants every persisted record must satisfy.
pub fn check_invariants(record: &CertificateRequest) -> Result<(), String> {
    let first = record
        .history
        .first()
        .ok_or_else(|| "history is empty".to_string())?;
    if first.from.is_some() || first.to != RequestState::Pending {
        return Err("history does not start with the PENDING transition".to_string());
    }

    if let Some(last) = record.history.last() {
        if last.to != record.state {
            return Err(format!(
                "last history entry targets {} but state is {}",
                last.to, record.state
            ));
        }
    }

    for pair in record.history.windows(2) {
        if pair[1].from != Some(pair[0].to) {
            return Err("history entries are not contiguous".to_string());
        }
    }

    let merged = merge(&record.issuance, &record.ticket);
    if merged != record.state {
        return Err(format!(
            "state {} disagrees with facets (merged {})",
            record.state, merged
        ));
    }

    let has_serial = record
        .certificate_serial()
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    if has_serial != record.state.exposes_certificate() {
        return Err(format!(
            "certificate serial presence does not match state {}",
            record.state
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    fn issued_cert(serial: &str) -> IssuedCertificate {
        fixtures::issued_certificate(serial)
    }

    fn apply(record: &CertificateRequest, event: LifecycleEvent) -> CertificateRequest {
        apply_event(record, &event, Utc::now()).unwrap()
    }

    #[test]
    fn test_merge_precedence() {
        let now = Utc::now();
        let created = TicketFacet::Created {
            ticket_id: "TCK-1".to_string(),
            created_at: now,
            synced_status: None,
        };
        let ticket_failed = TicketFacet::Failed {
            reason: "down".to_string(),
            attempts: 5,
            failed_at: now,
        };
        let issued = IssuanceFacet::Issued {
            certificate: issued_cert("01"),
        };
        let failed = IssuanceFacet::Failed {
            reason: "no".to_string(),
            permanent: true,
            attempts: 1,
            failed_at: now,
        };

        assert_eq!(merge(&IssuanceFacet::Pending, &TicketFacet::Pending), RequestState::Pending);
        assert_eq!(merge(&IssuanceFacet::Pending, &created), RequestState::Pending);
        assert_eq!(
            merge(&IssuanceFacet::Issuing { started_at: now }, &created),
            RequestState::Issuing
        );
        assert_eq!(merge(&issued, &TicketFacet::Pending), RequestState::AwaitingTicket);
        assert_eq!(merge(&issued, &created), RequestState::Issued);
        assert_eq!(merge(&issued, &ticket_failed), RequestState::TicketFailed);
        assert_eq!(merge(&failed, &ticket_failed), RequestState::IssuanceFailed);
        assert_eq!(merge(&failed, &created), RequestState::IssuanceFailed);
        assert_eq!(
            merge(
                &IssuanceFacet::Expired {
                    certificate: issued_cert("01"),
                    expired_at: now
                },
                &ticket_failed
            ),
            RequestState::Expired
        );
    }

    #[test]
    fn test_happy_path_history() {
        let record = fixtures::pending_request("svc.example.com");
        let record = apply(&record, LifecycleEvent::IssuanceStarted);
        assert_eq!(record.state, RequestState::Issuing);

        let record = apply(
            &record,
            LifecycleEvent::TicketCreated {
                ticket_id: "TCK-1001".to_string(),
            },
        );
        assert_eq!(record.state, RequestState::Issuing);

        let record = apply(
            &record,
            LifecycleEvent::IssuanceSucceeded {
                certificate: issued_cert("AA:BB"),
            },
        );
        assert_eq!(record.state, RequestState::Issued);
        assert_eq!(record.certificate_serial(), Some("AA:BB"));
        assert_eq!(record.ticket_id(), Some("TCK-1001"));

        let states: Vec<_> = record.history.iter().map(|h| h.to).collect();
        assert_eq!(
            states,
            vec![
                RequestState::Pending,
                RequestState::Issuing,
                RequestState::Issuing,
                RequestState::Issued
            ]
        );
        check_invariants(&record).unwrap();
    }

    #[test]
    fn test_awaiting_ticket_hides_serial() {
        let record = fixtures::pending_request("svc.example.com");
        let record = apply(&record, LifecycleEvent::IssuanceStarted);
        let record = apply(
            &record,
            LifecycleEvent::IssuanceSucceeded {
                certificate: issued_cert("01:02"),
            },
        );

        assert_eq!(record.state, RequestState::AwaitingTicket);
        assert!(record.certificate_serial().is_none());
        assert!(record.issuance.certificate().is_some());
        check_invariants(&record).unwrap();
    }

    #[test]
    fn test_ticket_failure_keeps_certificate() {
        let record = fixtures::pending_request("svc.example.com");
        let record = apply(&record, LifecycleEvent::IssuanceStarted);
        let record = apply(
            &record,
            LifecycleEvent::IssuanceSucceeded {
                certificate: issued_cert("01:03"),
            },
        );
        let record = apply(
            &record,
            LifecycleEvent::TicketFailed {
                reason: "ticketing down".to_string(),
                attempts: 5,
            },
        );

        assert_eq!(record.state, RequestState::TicketFailed);
        assert_eq!(
            record.issuance.certificate().map(|c| c.serial_number.as_str()),
            Some("01:03")
        );
        check_invariants(&record).unwrap();

        let record = apply(&record, LifecycleEvent::Expired);
        assert_eq!(record.state, RequestState::Expired);
        assert_eq!(record.certificate_serial(), Some("01:03"));
    }

    #[test]
    fn test_duplicate_event_is_rejected() {
        let record = fixtures::issued_request("svc.example.com", "AA:BB");
        let err = apply_event(
            &record,
            &LifecycleEvent::IssuanceSucceeded {
                certificate: issued_cert("CC:DD"),
            },
            Utc::now(),
        )
        .unwrap_err();

        assert_eq!(err.current_state, RequestState::Issued);
        assert_eq!(err.attempted_event, "issuance_succeeded");

        let err = apply_event(&record, &LifecycleEvent::IssuanceStarted, Utc::now()).unwrap_err();
        assert_eq!(err.attempted_event, "issuance_started");
    }

    #[test]
    fn test_repeated_status_sync_is_rejected() {
        let record = fixtures::issued_request("svc.example.com", "AA:BB");
        let synced = apply(
            &record,
            LifecycleEvent::TicketStatusSynced {
                status: TicketStatus::Issued,
            },
        );
        assert_eq!(synced.state, RequestState::Issued);
        assert_eq!(synced.history.len(), record.history.len() + 1);

        assert!(apply_event(
            &synced,
            &LifecycleEvent::TicketStatusSynced {
                status: TicketStatus::Issued
            },
            Utc::now()
        )
        .is_err());
    }

    #[test]
    fn test_final_states_only_self_loop() {
        for from in [
            RequestState::IssuanceFailed,
            RequestState::Expired,
            RequestState::Revoked,
        ] {
            assert!(from.is_final());
            for to in RequestState::ALL {
                assert_eq!(from.can_transition_to(to), from == to, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_edge_table_rejects_skips() {
        assert!(!RequestState::Pending.can_transition_to(RequestState::Issued));
        assert!(!RequestState::Issued.can_transition_to(RequestState::Pending));
        assert!(!RequestState::Issued.can_transition_to(RequestState::TicketFailed));
        assert!(RequestState::AwaitingTicket.can_transition_to(RequestState::Issued));
    }

    #[test]
    fn test_revoked_from_expired_is_rejected() {
        let record = fixtures::issued_request("svc.example.com", "AA:BB");
        let expired = apply(&record, LifecycleEvent::Expired);
        let err = apply_event(
            &expired,
            &LifecycleEvent::Revoked {
                revoked_by: "bob".to_string(),
                reason: None,
            },
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.current_state, RequestState::Expired);
    }

    #[test]
    fn test_invariant_detects_tampering() {
        let mut record = fixtures::issued_request("svc.example.com", "AA:BB");
        record.state = RequestState::Pending;
        assert!(check_invariants(&record).is_err());

        let mut record = fixtures::pending_request("svc.example.com");
        record.history.clear();
        assert!(check_invariants(&record).is_err());
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!(
            "awaiting_ticket".parse::<RequestState>().unwrap(),
            RequestState::AwaitingTicket
        );
        assert_eq!("ISSUED".parse::<RequestState>().unwrap(), RequestState::Issued);
        assert!("done".parse::<RequestState>().is_err());
        assert_eq!(
            serde_json::to_string(&RequestState::TicketFailed).unwrap(),
            "\"TICKET_FAILED\""
        );
    }
}

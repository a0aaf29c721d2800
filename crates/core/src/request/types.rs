use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::{HistoryEntry, IssuanceFacet, RequestState, TicketFacet};
use crate::pki::IssuedCertificate;
use crate::ticketing::TicketStatus;

/// Caller input rejected before any record is created.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// X.509 key usage flags accepted on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    DigitalSignature,
    ContentCommitment,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    CertSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
}

impl KeyUsage {
    pub const ALL: [KeyUsage; 9] = [
        KeyUsage::DigitalSignature,
        KeyUsage::ContentCommitment,
        KeyUsage::KeyEncipherment,
        KeyUsage::DataEncipherment,
        KeyUsage::KeyAgreement,
        KeyUsage::CertSign,
        KeyUsage::CrlSign,
        KeyUsage::EncipherOnly,
        KeyUsage::DecipherOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyUsage::DigitalSignature => "digital_signature",
            KeyUsage::ContentCommitment => "content_commitment",
            KeyUsage::KeyEncipherment => "key_encipherment",
            KeyUsage::DataEncipherment => "data_encipherment",
            KeyUsage::KeyAgreement => "key_agreement",
            KeyUsage::CertSign => "cert_sign",
            KeyUsage::CrlSign => "crl_sign",
            KeyUsage::EncipherOnly => "encipher_only",
            KeyUsage::DecipherOnly => "decipher_only",
        }
    }

    /// Name used by the Vault PKI engine (`DigitalSignature`, `KeyEncipherment`, ...).
    pub fn vault_name(&self) -> &'static str {
        match self {
            KeyUsage::DigitalSignature => "DigitalSignature",
            KeyUsage::ContentCommitment => "ContentCommitment",
            KeyUsage::KeyEncipherment => "KeyEncipherment",
            KeyUsage::DataEncipherment => "DataEncipherment",
            KeyUsage::KeyAgreement => "KeyAgreement",
            KeyUsage::CertSign => "CertSign",
            KeyUsage::CrlSign => "CRLSign",
            KeyUsage::EncipherOnly => "EncipherOnly",
            KeyUsage::DecipherOnly => "DecipherOnly",
        }
    }
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyUsage {
    type Err = String;

    /// Accepts `digital_signature`, `digitalSignature`, `DigitalSignature`
    /// and `digital-signature` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();

        KeyUsage::ALL
            .iter()
            .find(|usage| usage.as_str().replace('_', "") == folded)
            .copied()
            .ok_or_else(|| format!("unknown key usage '{}'", s))
    }
}

/// Optional subject attributes beyond the common name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
}

/// TTL as sent by a caller: either a duration string or a bare number of hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTtl {
    Hours(u64),
    Text(String),
}

impl From<&str> for RawTtl {
    fn from(s: &str) -> Self {
        RawTtl::Text(s.to_string())
    }
}

/// Unvalidated certificate request, as received from the outer layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCertificateRequest {
    #[serde(default)]
    pub subject_name: Option<String>,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
    #[serde(default)]
    pub ttl: Option<RawTtl>,
    #[serde(default)]
    pub key_usage: Vec<String>,
    #[serde(default)]
    pub requester: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
}

impl RawCertificateRequest {
    pub fn new(subject_name: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            subject_name: Some(subject_name.into()),
            requester: Some(requester.into()),
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: impl Into<RawTtl>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    pub fn with_alt_name(mut self, name: impl Into<String>) -> Self {
        self.subject_alt_names.push(name.into());
        self
    }

    pub fn with_key_usage(mut self, usage: impl Into<String>) -> Self {
        self.key_usage.push(usage.into());
        self
    }
}

/// Validated, immutable certificate attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedCertificate {
    pub subject_name: String,
    #[serde(default)]
    pub subject: SubjectAttributes,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
    pub ttl_secs: u64,
    pub key_usage: Vec<KeyUsage>,
}

impl RequestedCertificate {
    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ttl_secs)
    }
}

/// One submitted certificate request and its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub id: String,
    pub requester: String,
    pub requested: RequestedCertificate,
    /// Composite state, always `merge(issuance, ticket)`.
    pub state: RequestState,
    pub issuance: IssuanceFacet,
    pub ticket: TicketFacet,
    pub history: Vec<HistoryEntry>,
    /// Request whose certificate this one replaces, set on rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_from: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CertificateRequest {
    /// A fresh record in `PENDING`, with its initial history entry.
    pub fn new_pending(
        id: impl Into<String>,
        requester: impl Into<String>,
        requested: RequestedCertificate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            requester: requester.into(),
            requested,
            state: RequestState::Pending,
            issuance: IssuanceFacet::Pending,
            ticket: TicketFacet::Pending,
            history: vec![HistoryEntry::submitted(now)],
            rotated_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn ticket_id(&self) -> Option<&str> {
        self.ticket.ticket_id()
    }

    /// Whether the ticket needs no further reconciliation: it failed for
    /// good, or its last confirmed status matches the issuance facet.
    pub fn ticket_settled(&self) -> bool {
        match &self.ticket {
            TicketFacet::Pending => false,
            TicketFacet::Failed { .. } => true,
            TicketFacet::Created { synced_status, .. } => {
                *synced_status == Some(TicketStatus::desired_for(&self.issuance))
            }
        }
    }

    /// Issued certificate, visible only once the composite state is
    /// `ISSUED`, `EXPIRED` or `REVOKED`.
    pub fn certificate(&self) -> Option<&IssuedCertificate> {
        if self.state.exposes_certificate() {
            self.issuance.certificate()
        } else {
            None
        }
    }

    pub fn certificate_serial(&self) -> Option<&str> {
        self.certificate().map(|c| c.serial_number.as_str())
    }

    pub fn certificate_pem(&self) -> Option<&str> {
        self.certificate().map(|c| c.certificate_pem.as_str())
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.certificate().map(|c| c.issued_at)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.certificate().map(|c| c.expires_at)
    }

    /// Whether the sweep should replace this certificate.
    ///
    /// Only live `ISSUED` certificates within `threshold` of their expiry
    /// qualify, and only when the requested lifetime exceeds the threshold.
    pub fn due_for_rotation(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.state != RequestState::Issued || threshold <= Duration::zero() {
            return false;
        }
        if Duration::seconds(self.requested.ttl_secs as i64) <= threshold {
            return false;
        }
        match self.expires_at() {
            Some(expires_at) => expires_at > now && expires_at - now <= threshold,
            None => false,
        }
    }

    /// A new `PENDING` request for the same attributes, linked back to this one.
    pub fn successor(&self, id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut next = Self::new_pending(id, self.requester.clone(), self.requested.clone(), now);
        next.history[0].cause = Some(format!("rotation of request {}", self.id));
        next.rotated_from = Some(self.id.clone());
        next
    }

    /// Remaining validity of the issued certificate; zero once expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        let cert = self.certificate()?;
        if self.state == RequestState::Revoked {
            return Some(Duration::zero());
        }
        Some((cert.expires_at - now).max(Duration::zero()))
    }
}

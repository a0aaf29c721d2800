use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendError;
use crate::request::{common_name, CertificateRequest, KeyUsage, SubjectAttributes};

/// Certificate material returned by the PKI engine.
///
/// The private key is handed to the requester by the PKI engine and never
/// reaches this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub serial_number: String,
    /// Leaf certificate followed by the issuing chain.
    pub certificate_pem: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// What is sent to the PKI engine for one issuance attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PkiIssueRequest {
    pub common_name: String,
    /// DNS subject alternative names.
    pub alt_names: Vec<String>,
    /// IP subject alternative names.
    pub ip_sans: Vec<String>,
    pub ttl_secs: u64,
    pub key_usage: Vec<KeyUsage>,
    pub subject: SubjectAttributes,
}

impl From<&CertificateRequest> for PkiIssueRequest {
    fn from(record: &CertificateRequest) -> Self {
        let requested = &record.requested;
        let (ip_sans, alt_names): (Vec<String>, Vec<String>) = requested
            .subject_alt_names
            .iter()
            .cloned()
            .partition(|name| name.parse::<IpAddr>().is_ok());

        Self {
            common_name: common_name(&requested.subject_name).to_string(),
            alt_names,
            ip_sans,
            ttl_secs: requested.ttl_secs,
            key_usage: requested.key_usage.clone(),
            subject: requested.subject.clone(),
        }
    }
}

/// Result of a revocation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    /// The PKI engine already considered the serial revoked.
    AlreadyRevoked,
}

/// Certificate issuing backend.
#[async_trait]
pub trait PkiEngine: Send + Sync {
    /// Backend name for logs and metrics (e.g. "vault").
    fn name(&self) -> &str;

    /// Issue one certificate. A single call, with no retrying of its own.
    async fn issue(&self, request: &PkiIssueRequest) -> Result<IssuedCertificate, BackendError>;

    /// Revoke a previously issued certificate by serial.
    async fn revoke(&self, serial_number: &str) -> Result<RevokeOutcome, BackendError>;
}

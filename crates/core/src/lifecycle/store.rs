//! Record storage trait and types.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{RequestState, TransitionError};
use crate::request::CertificateRequest;

/// Error type for lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Certificate request not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The PKI returned a serial already held by another request.
    #[error("Certificate serial {serial} is already held by request {holder}")]
    DuplicateSerial { serial: String, holder: String },

    /// The request already has a rotation successor.
    #[error("Certificate request {request_id} was already rotated to {successor}")]
    AlreadyRotated { request_id: String, successor: String },

    #[error("Invariant violated for request {request_id}: {reason}")]
    InvariantViolation { request_id: String, reason: String },

    #[error("Database error: {0}")]
    Database(String),
}

impl LifecycleError {
    pub fn is_transition(&self) -> bool {
        matches!(self, LifecycleError::Transition(_))
    }
}

/// Filter for querying certificate requests.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Match any of these states (empty = all).
    pub states: Vec<RequestState>,
    /// Filter by requester.
    pub requester: Option<String>,
    /// Only records whose issued certificate ends at or before this instant.
    pub expires_before: Option<DateTime<Utc>>,
    /// Only records whose ticket still needs reconciliation.
    pub unsettled_ticket: bool,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            requester: None,
            expires_before: None,
            unsettled_ticket: false,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_state(mut self, state: RequestState) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn with_expires_before(mut self, at: DateTime<Utc>) -> Self {
        self.expires_before = Some(at);
        self
    }

    pub fn with_unsettled_ticket(mut self) -> Self {
        self.unsettled_ticket = true;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Durable storage for certificate request records.
///
/// Implementations only persist; transition rules and per-request
/// serialization live in [`super::LifecycleStore`].
pub trait RecordStore: Send + Sync {
    /// Insert a new record. Fails if the id already exists.
    fn insert(&self, record: &CertificateRequest) -> Result<(), LifecycleError>;

    /// Get a record by id.
    fn get(&self, id: &str) -> Result<Option<CertificateRequest>, LifecycleError>;

    /// Overwrite an existing record.
    fn save(&self, record: &CertificateRequest) -> Result<(), LifecycleError>;

    /// List records matching the filter, oldest first.
    fn list(&self, filter: &RecordFilter) -> Result<Vec<CertificateRequest>, LifecycleError>;

    /// Count records matching the filter (ignores limit/offset).
    fn count(&self, filter: &RecordFilter) -> Result<i64, LifecycleError>;

    /// Find the request holding the given certificate serial, if any.
    fn find_by_serial(&self, serial: &str) -> Result<Option<String>, LifecycleError>;

    /// Find the request created to rotate `id`, if any.
    fn find_successor(&self, id: &str) -> Result<Option<String>, LifecycleError>;
}

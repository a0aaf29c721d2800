use chrono::{DateTime, Utc};
use thiserror::Error;

use super::AuditRecord;

/// Page size applied when a filter does not set one.
pub const DEFAULT_AUDIT_LIMIT: i64 = 100;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit database error: {0}")]
    Database(String),

    #[error("audit serialization error: {0}")]
    Serialization(String),
}

/// Selects audit records; all set criteria must match.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Certificate request the event concerns.
    pub request_id: Option<String>,
    /// Snake-case event name, as returned by `AuditEvent::event_type`.
    pub event_type: Option<String>,
    /// Requester or revoking user.
    pub user_id: Option<String>,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub to: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self {
            limit: DEFAULT_AUDIT_LIMIT,
            ..Default::default()
        }
    }

    /// Every event recorded for one certificate request.
    pub fn for_request(request_id: impl Into<String>) -> Self {
        Self::new().with_request_id(request_id)
    }

    pub fn with_request_id(self, request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..self
        }
    }

    pub fn with_event_type(self, event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..self
        }
    }

    pub fn with_user_id(self, user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..self
        }
    }

    pub fn with_time_range(self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self { from, to, ..self }
    }

    pub fn with_limit(self, limit: i64) -> Self {
        Self { limit, ..self }
    }

    pub fn with_offset(self, offset: i64) -> Self {
        Self { offset, ..self }
    }
}

/// Append-only storage for the audit trail.
pub trait AuditStore: Send + Sync {
    /// Persist one record and return its row id.
    fn insert(&self, record: &AuditRecord) -> Result<i64, AuditError>;

    /// Matching records, newest first, paginated by the filter.
    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError>;

    /// Number of matching records, ignoring pagination.
    fn count(&self, filter: &AuditFilter) -> Result<i64, AuditError>;
}

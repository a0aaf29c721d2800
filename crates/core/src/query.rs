//! Read-only access to certificate request records.

use std::sync::Arc;

use thiserror::Error;

use crate::lifecycle::{LifecycleError, LifecycleStore, RecordFilter};
use crate::request::CertificateRequest;

/// No request exists with the given id.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("certificate request not found: {request_id}")]
pub struct NotFoundError {
    pub request_id: String,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<LifecycleError> for QueryError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(request_id) => NotFoundError { request_id }.into(),
            other => QueryError::Storage(other.to_string()),
        }
    }
}

/// Projection of the lifecycle store for external callers.
///
/// Never applies a transition.
#[derive(Clone)]
pub struct StatusQuery {
    store: Arc<LifecycleStore>,
}

impl StatusQuery {
    pub fn new(store: Arc<LifecycleStore>) -> Self {
        Self { store }
    }

    /// The current composite record, including its full history.
    pub fn get(&self, request_id: &str) -> Result<CertificateRequest, QueryError> {
        Ok(self.store.get(request_id)?)
    }

    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<CertificateRequest>, QueryError> {
        Ok(self.store.list(filter)?)
    }

    pub fn count(&self, filter: &RecordFilter) -> Result<i64, QueryError> {
        Ok(self.store.count(filter)?)
    }

    /// Id of the request that rotated `request_id`, if it was rotated.
    pub fn successor(&self, request_id: &str) -> Result<Option<String>, QueryError> {
        Ok(self.store.successor_of(request_id)?)
    }
}

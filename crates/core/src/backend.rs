//! Failure classification shared by the external backends.
//!
//! Every call into the PKI engine or the ticketing system reports failures as a
//! [`BackendError`], which tells the retry policy whether another attempt may
//! succeed.

use thiserror::Error;

/// A failed call to an external backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend is temporarily unavailable (network, timeout, 5xx).
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The backend rejected the request on its merits.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    /// Whether the retry policy may attempt the call again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The originating reason, without the classification prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(reason) | Self::Permanent(reason) => reason,
        }
    }

    /// Classify a non-success HTTP status.
    ///
    /// Server errors, `408` and `429` are transient; every other status is a
    /// rejection of the request itself.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let reason = if detail.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, detail)
        };

        if status >= 500 || status == 408 || status == 429 {
            Self::Transient(reason)
        } else {
            Self::Permanent(reason)
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Transient(format!("request timed out: {}", e))
        } else if e.is_connect() {
            Self::Transient(format!("connection failed: {}", e))
        } else if e.is_decode() {
            Self::Permanent(format!("unreadable response: {}", e))
        } else if let Some(status) = e.status() {
            Self::from_status(status.as_u16(), e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(BackendError::from_status(500, "").is_transient());
        assert!(BackendError::from_status(503, "unavailable").is_transient());
        assert!(BackendError::from_status(429, "slow down").is_transient());
        assert!(BackendError::from_status(408, "").is_transient());

        assert!(!BackendError::from_status(400, "bad request").is_transient());
        assert!(!BackendError::from_status(403, "denied").is_transient());
        assert!(!BackendError::from_status(404, "").is_transient());
    }

    #[test]
    fn test_reason_strips_classification() {
        let err = BackendError::permanent("name not permitted");
        assert_eq!(err.reason(), "name not permitted");
        assert_eq!(
            err.to_string(),
            "permanent backend error: name not permitted"
        );

        let err = BackendError::from_status(502, "");
        assert_eq!(err.reason(), "HTTP 502");
    }
}

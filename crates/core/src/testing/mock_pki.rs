//! Mock PKI engine for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::backend::BackendError;
use crate::pki::{IssuedCertificate, PkiEngine, PkiIssueRequest, RevokeOutcome};

/// An issuance call recorded for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedIssue {
    pub request: PkiIssueRequest,
    /// Time since the mock was created, on the tokio clock.
    pub offset: Duration,
}

/// Mock implementation of the PkiEngine trait.
///
/// Provides controllable behavior for testing:
/// - Queue serial numbers or let them be generated
/// - Queue failures (transient or permanent) consumed one per call
/// - Delay every call, to exercise attempt timeouts
/// - Record calls and their start times
///
/// # Example
///
/// ```rust,ignore
/// use certflow_core::testing::MockPkiEngine;
/// use certflow_core::BackendError;
///
/// let pki = MockPkiEngine::new();
/// pki.push_failure(BackendError::transient("HTTP 503")).await;
/// pki.set_serials(vec!["AA:BB:CC:01"]).await;
///
/// // First call fails, the retry gets AA:BB:CC:01
/// ```
pub struct MockPkiEngine {
    serials: Arc<RwLock<VecDeque<String>>>,
    failures: Arc<RwLock<VecDeque<BackendError>>>,
    revoke_failures: Arc<RwLock<VecDeque<BackendError>>>,
    delay: Arc<RwLock<Option<Duration>>>,
    issue_calls: Arc<RwLock<Vec<RecordedIssue>>>,
    revoked: Arc<RwLock<Vec<String>>>,
    next_serial: AtomicU32,
    origin: Instant,
}

impl std::fmt::Debug for MockPkiEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPkiEngine")
            .field("serials", &"<serials>")
            .field("failures", &"<failures>")
            .field("issue_calls", &"<calls>")
            .field("revoked", &"<revoked>")
            .finish()
    }
}

impl Default for MockPkiEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPkiEngine {
    /// Create a mock that issues successfully with generated serials.
    pub fn new() -> Self {
        Self {
            serials: Arc::new(RwLock::new(VecDeque::new())),
            failures: Arc::new(RwLock::new(VecDeque::new())),
            revoke_failures: Arc::new(RwLock::new(VecDeque::new())),
            delay: Arc::new(RwLock::new(None)),
            issue_calls: Arc::new(RwLock::new(Vec::new())),
            revoked: Arc::new(RwLock::new(Vec::new())),
            next_serial: AtomicU32::new(1),
            origin: Instant::now(),
        }
    }

    /// Serials handed out by the next successful calls, in order.
    pub async fn set_serials(&self, serials: Vec<&str>) {
        *self.serials.write().await = serials.into_iter().map(String::from).collect();
    }

    /// Fail the next issuance call that would otherwise succeed.
    pub async fn push_failure(&self, error: BackendError) {
        self.failures.write().await.push_back(error);
    }

    pub async fn push_revoke_failure(&self, error: BackendError) {
        self.revoke_failures.write().await.push_back(error);
    }

    /// Delay every call by `delay` (on the tokio clock).
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }

    pub async fn issue_count(&self) -> usize {
        self.issue_calls.read().await.len()
    }

    pub async fn issue_calls(&self) -> Vec<PkiIssueRequest> {
        self.issue_calls
            .read()
            .await
            .iter()
            .map(|c| c.request.clone())
            .collect()
    }

    /// When each issuance call started, relative to the mock's creation.
    pub async fn call_offsets(&self) -> Vec<Duration> {
        self.issue_calls
            .read()
            .await
            .iter()
            .map(|c| c.offset)
            .collect()
    }

    /// Serials revoked so far.
    pub async fn revoked(&self) -> Vec<String> {
        self.revoked.read().await.clone()
    }

    async fn wait(&self) {
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn next_serial(&self) -> String {
        if let Some(serial) = self.serials.write().await.pop_front() {
            return serial;
        }
        let n = self.next_serial.fetch_add(1, Ordering::SeqCst);
        format!("AA:BB:{:02X}", n)
    }
}

#[async_trait]
impl PkiEngine for MockPkiEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn issue(&self, request: &PkiIssueRequest) -> Result<IssuedCertificate, BackendError> {
        self.issue_calls.write().await.push(RecordedIssue {
            request: request.clone(),
            offset: self.origin.elapsed(),
        });
        self.wait().await;

        if let Some(error) = self.failures.write().await.pop_front() {
            return Err(error);
        }

        let serial_number = self.next_serial().await;
        let issued_at = chrono::Utc::now();
        Ok(IssuedCertificate {
            certificate_pem: format!(
                "-----BEGIN CERTIFICATE-----\nMOCK {} {}\n-----END CERTIFICATE-----\n",
                request.common_name, serial_number
            ),
            serial_number,
            issued_at,
            expires_at: issued_at + chrono::Duration::seconds(request.ttl_secs as i64),
        })
    }

    async fn revoke(&self, serial_number: &str) -> Result<RevokeOutcome, BackendError> {
        self.wait().await;

        if let Some(error) = self.revoke_failures.write().await.pop_front() {
            return Err(error);
        }

        let mut revoked = self.revoked.write().await;
        if revoked.iter().any(|s| s == serial_number) {
            return Ok(RevokeOutcome::AlreadyRevoked);
        }
        revoked.push(serial_number.to_string());
        Ok(RevokeOutcome::Revoked)
    }
}

//! Common test utilities for API testing with mock backends.
//!
//! The fixture builds the real router over a temporary SQLite database,
//! with the PKI engine and ticketing system replaced by scriptable mocks.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use certflow_core::{
    create_audit_system, load_config_from_str, AuditStore, CertificateOrchestrator,
    LifecycleStore, PkiEngine, RecordStore, SqliteAuditStore, SqliteRecordStore, TicketingSystem,
    testing::{MockPkiEngine, MockTicketingSystem},
};
use certflow_server::state::AppState;

/// Test fixture for API testing with mock backends.
///
/// The orchestrator is not started unless requested; tests drive issuance
/// and reconciliation explicitly through [`TestFixture::orchestrator`].
pub struct TestFixture {
    pub router: Router,
    pub orchestrator: Arc<CertificateOrchestrator>,
    pub audit_store: Arc<dyn AuditStore>,
    pub pki: Arc<MockPkiEngine>,
    pub ticketing: Arc<MockTicketingSystem>,
    /// Holds the test database
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

fn test_config_toml(db_path: &std::path::Path) -> String {
    format!(
        r#"
[server]
host = "127.0.0.1"
port = 0

[database]
path = "{}"

[pki]
backend = "vault"

[pki.vault]
address = "http://vault.test:8200"
token = "s.test-token"
role = "web"

[ticketing]
backend = "servicenow"

[ticketing.servicenow]
instance_url = "https://example.service-now.com"
username = "certflow"
password = "secret"

[orchestrator]
enabled = false

[orchestrator.issuance_retry]
max_attempts = 3
initial_delay_ms = 1
max_delay_ms = 5

[orchestrator.ticket_retry]
max_attempts = 3
initial_delay_ms = 1
max_delay_ms = 5
"#,
        db_path.display()
    )
}

impl TestFixture {
    /// Create a new test fixture with a stopped orchestrator.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let config =
            load_config_from_str(&test_config_toml(&db_path)).expect("Failed to parse config");

        let pki = Arc::new(MockPkiEngine::new());
        let ticketing = Arc::new(MockTicketingSystem::new());

        let audit_store: Arc<dyn AuditStore> =
            Arc::new(SqliteAuditStore::new(&db_path).expect("Failed to create audit store"));
        let records: Arc<dyn RecordStore> =
            Arc::new(SqliteRecordStore::new(&db_path).expect("Failed to create record store"));

        let (audit_handle, audit_writer) = create_audit_system(Arc::clone(&audit_store), 100);
        tokio::spawn(audit_writer.run());

        let store = Arc::new(LifecycleStore::new(records).with_audit(audit_handle.clone()));
        let orchestrator = Arc::new(CertificateOrchestrator::new(
            config.orchestrator.clone(),
            config.validation.clone(),
            store,
            Arc::clone(&pki) as Arc<dyn PkiEngine>,
            Arc::clone(&ticketing) as Arc<dyn TicketingSystem>,
            Some(audit_handle.clone()),
        ));

        let state = Arc::new(AppState::new(
            config,
            audit_handle,
            Arc::clone(&audit_store),
            Arc::clone(&orchestrator),
        ));

        let router = certflow_server::api::create_router(state);

        Self {
            router,
            orchestrator,
            audit_store,
            pki,
            ticketing,
            temp_dir,
        }
    }

    /// Submit a valid request and return its id.
    pub async fn submit(&self, subject: &str) -> String {
        let response = self
            .post(
                "/api/v1/certificates",
                serde_json::json!({
                    "subject_name": subject,
                    "requester": "alice",
                    "ttl": "24h",
                }),
            )
            .await;
        assert_eq!(response.status, StatusCode::ACCEPTED, "{}", response.body);
        response.body["id"]
            .as_str()
            .expect("submit response has an id")
            .to_string()
    }

    /// Submit a request and drive it to `ISSUED` with its ticket synced.
    pub async fn submit_issued(&self, subject: &str) -> String {
        let id = self.submit(subject).await;
        tokio_test::assert_ok!(self.orchestrator.issue(&id).await);
        self.orchestrator.wait_idle().await;
        id
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a request and return the raw text body.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}

/// Helper to assert a response has expected status.
#[macro_export]
macro_rules! assert_status {
    ($response:expr, $status:expr) => {
        assert_eq!(
            $response.status, $status,
            "Expected status {:?}, got {:?}. Body: {}",
            $status,
            $response.status,
            serde_json::to_string_pretty(&$response.body).unwrap_or_default()
        );
    };
}

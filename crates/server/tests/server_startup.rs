use std::io::Write;
use std::net::TcpListener;
use std::time::Duration;

use reqwest::Client;
use tempfile::{NamedTempFile, TempDir};
use tokio::time::{sleep, timeout};

/// Find an available port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Minimal valid config. The backends are never contacted: the orchestrator
/// is disabled and no request is submitted.
fn minimal_config(port: u16, db_dir: &TempDir) -> String {
    format!(
        r#"
[server]
host = "127.0.0.1"
port = {}

[database]
path = "{}"

[pki]
backend = "vault"

[pki.vault]
address = "http://127.0.0.1:1"
token = "s.startup-token"
role = "web"

[ticketing]
backend = "servicenow"

[ticketing.servicenow]
instance_url = "http://127.0.0.1:1"
username = "certflow"
password = "startup-password"

[orchestrator]
enabled = false
"#,
        port,
        db_dir.path().join("certflow.db").display()
    )
}

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

/// Spawn the server and return a handle
async fn spawn_server(config_path: &std::path::Path) -> tokio::process::Child {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_certflow"))
        .env("CERTFLOW_CONFIG", config_path)
        .env("RUST_LOG", "error")
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn server")
}

/// Wait for server to be ready
async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    let client = Client::new();
    for _ in 0..max_attempts {
        if client
            .get(format!("http://127.0.0.1:{}/api/v1/health", port))
            .send()
            .await
            .is_ok()
        {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn run_to_exit(config_path: &std::path::Path) -> std::process::Output {
    timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(env!("CARGO_BIN_EXE_certflow"))
            .env("CERTFLOW_CONFIG", config_path)
            .env("RUST_LOG", "error")
            .output(),
    )
    .await
    .expect("Command timed out")
    .expect("Failed to execute command")
}

#[tokio::test]
async fn test_server_serves_health_config_and_metrics() {
    let port = get_available_port();
    let db_dir = TempDir::new().unwrap();
    let config_file = write_config(&minimal_config(port, &db_dir));

    let mut server = spawn_server(config_file.path()).await;
    assert!(
        wait_for_server(port, 40).await,
        "Server did not start in time"
    );

    let client = Client::new();

    let health: serde_json::Value = client
        .get(format!("http://127.0.0.1:{}/api/v1/health", port))
        .send()
        .await
        .expect("Failed to send request")
        .json()
        .await
        .expect("Failed to parse JSON");
    assert_eq!(health["status"], "ok");

    let config_text = client
        .get(format!("http://127.0.0.1:{}/api/v1/config", port))
        .send()
        .await
        .expect("Failed to send request")
        .text()
        .await
        .unwrap();
    let config: serde_json::Value = serde_json::from_str(&config_text).unwrap();
    assert_eq!(config["server"]["port"], port);
    assert_eq!(config["orchestrator"]["enabled"], false);
    assert!(!config_text.contains("s.startup-token"));
    assert!(!config_text.contains("startup-password"));

    let metrics = client
        .get(format!("http://127.0.0.1:{}/metrics", port))
        .send()
        .await
        .expect("Failed to send request");
    assert!(metrics.status().is_success());
    let body = metrics.text().await.unwrap();
    assert!(body.contains("certflow_orchestrator_running 0"));

    server.kill().await.ok();
}

#[tokio::test]
async fn test_missing_config_file_exits_with_error() {
    let result = run_to_exit(std::path::Path::new("/nonexistent/config.toml")).await;

    assert!(!result.status.success());
}

#[tokio::test]
async fn test_missing_pki_section_exits_with_error() {
    let config_file = write_config(
        r#"
[server]
port = 8080

[ticketing]
backend = "servicenow"

[ticketing.servicenow]
instance_url = "http://127.0.0.1:1"
username = "certflow"
password = "pw"
"#,
    );

    let result = run_to_exit(config_file.path()).await;

    assert!(!result.status.success());
}

#[tokio::test]
async fn test_vault_backend_without_vault_section_exits_with_error() {
    let config_file = write_config(
        r#"
[pki]
backend = "vault"

[ticketing]
backend = "servicenow"

[ticketing.servicenow]
instance_url = "http://127.0.0.1:1"
username = "certflow"
password = "pw"
"#,
    );

    let result = run_to_exit(config_file.path()).await;

    assert!(!result.status.success());
}

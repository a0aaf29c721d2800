use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::orchestrator::OrchestratorConfig;
use crate::request::KeyUsage;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub pki: PkiConfig,
    pub ticketing: TicketingConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite file holding both certificate requests and the audit trail.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("certflow.db")
}

/// PKI engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PkiConfig {
    pub backend: PkiBackend,
    /// Required when backend = "vault"
    #[serde(default)]
    pub vault: Option<VaultConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PkiBackend {
    Vault,
}

/// Vault PKI secrets engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VaultConfig {
    /// Vault server address (e.g., "https://vault.internal:8200")
    pub address: String,
    pub token: String,
    /// Enterprise namespace, sent as `X-Vault-Namespace`
    #[serde(default)]
    pub namespace: Option<String>,
    /// PKI secrets engine mount path
    #[serde(default = "default_vault_mount")]
    pub mount: String,
    /// Role used for issuance
    pub role: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_vault_mount() -> String {
    "pki".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Ticketing system configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TicketingConfig {
    pub backend: TicketingBackend,
    /// Required when backend = "servicenow"
    #[serde(default)]
    pub servicenow: Option<ServiceNowConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketingBackend {
    #[serde(rename = "servicenow")]
    ServiceNow,
}

/// ServiceNow Table API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceNowConfig {
    /// Instance URL (e.g., "https://example.service-now.com")
    pub instance_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_servicenow_table")]
    pub table: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_servicenow_table() -> String {
    "u_certificate_request".to_string()
}

/// Bounds applied by the request validator
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ValidationConfig {
    #[serde(default = "default_min_ttl")]
    pub min_ttl_secs: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_secs: u64,
    /// TTL applied when a request carries none
    #[serde(default = "default_max_ttl")]
    pub default_ttl_secs: u64,
    /// Key usages applied when a request carries none
    #[serde(default = "default_key_usage")]
    pub default_key_usage: Vec<KeyUsage>,
}

fn default_min_ttl() -> u64 {
    3600 // 1 hour
}

fn default_max_ttl() -> u64 {
    8760 * 3600 // 1 year
}

fn default_key_usage() -> Vec<KeyUsage> {
    vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment]
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_ttl_secs: default_min_ttl(),
            max_ttl_secs: default_max_ttl(),
            default_ttl_secs: default_max_ttl(),
            default_key_usage: default_key_usage(),
        }
    }
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub pki: SanitizedPkiConfig,
    pub ticketing: SanitizedTicketingConfig,
    pub validation: ValidationConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedPkiConfig {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault: Option<SanitizedVaultConfig>,
}

/// Vault config with the token hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedVaultConfig {
    pub address: String,
    pub token_configured: bool,
    pub namespace: Option<String>,
    pub mount: String,
    pub role: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedTicketingConfig {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servicenow: Option<SanitizedServiceNowConfig>,
}

/// ServiceNow config with the password hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedServiceNowConfig {
    pub instance_url: String,
    pub username: String,
    pub password_configured: bool,
    pub table: String,
    pub timeout_secs: u64,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            pki: SanitizedPkiConfig {
                backend: match config.pki.backend {
                    PkiBackend::Vault => "vault".to_string(),
                },
                vault: config.pki.vault.as_ref().map(|v| SanitizedVaultConfig {
                    address: v.address.clone(),
                    token_configured: !v.token.is_empty(),
                    namespace: v.namespace.clone(),
                    mount: v.mount.clone(),
                    role: v.role.clone(),
                    timeout_secs: v.timeout_secs,
                }),
            },
            ticketing: SanitizedTicketingConfig {
                backend: match config.ticketing.backend {
                    TicketingBackend::ServiceNow => "servicenow".to_string(),
                },
                servicenow: config
                    .ticketing
                    .servicenow
                    .as_ref()
                    .map(|s| SanitizedServiceNowConfig {
                        instance_url: s.instance_url.clone(),
                        username: s.username.clone(),
                        password_configured: !s.password.is_empty(),
                        table: s.table.clone(),
                        timeout_secs: s.timeout_secs,
                    }),
            },
            validation: config.validation.clone(),
            orchestrator: config.orchestrator.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[pki]
backend = "vault"

[pki.vault]
address = "https://vault.internal:8200"
token = "s.secret"
role = "web"

[ticketing]
backend = "servicenow"

[ticketing.servicenow]
instance_url = "https://example.service-now.com"
username = "svc-certflow"
password = "hunter2"
"#;

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = toml::from_str(MINIMAL).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.path, PathBuf::from("certflow.db"));
        assert_eq!(config.pki.backend, PkiBackend::Vault);

        let vault = config.pki.vault.unwrap();
        assert_eq!(vault.mount, "pki");
        assert_eq!(vault.timeout_secs, 30);
        assert!(vault.namespace.is_none());

        let snow = config.ticketing.servicenow.unwrap();
        assert_eq!(snow.table, "u_certificate_request");
        assert_eq!(config.validation, ValidationConfig::default());
    }

    #[test]
    fn test_deserialize_missing_pki_fails() {
        let toml = r#"
[ticketing]
backend = "servicenow"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_deserialize_validation_overrides() {
        let toml = format!(
            "{}\n[validation]\nmax_ttl_secs = 172800\ndefault_key_usage = [\"digital_signature\"]\n",
            MINIMAL
        );
        let config: Config = toml::from_str(&toml).unwrap();
        assert_eq!(config.validation.max_ttl_secs, 172_800);
        assert_eq!(config.validation.min_ttl_secs, 3600);
        assert_eq!(
            config.validation.default_key_usage,
            vec![KeyUsage::DigitalSignature]
        );
    }

    #[test]
    fn test_sanitized_config_hides_secrets() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        let sanitized = SanitizedConfig::from(&config);

        let vault = sanitized.pki.vault.as_ref().unwrap();
        assert!(vault.token_configured);
        let snow = sanitized.ticketing.servicenow.as_ref().unwrap();
        assert!(snow.password_configured);

        let json = serde_json::to_string(&sanitized).unwrap();
        assert!(!json.contains("s.secret"));
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"backend\":\"servicenow\""));
    }
}

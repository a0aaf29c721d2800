use super::{types::Config, ConfigError, PkiBackend, TicketingBackend};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - The selected PKI and ticketing backends have their sections
/// - TTL bounds are ordered and the default TTL lies within them
/// - Retry policies allow at least one attempt
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Server validation
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    match config.pki.backend {
        PkiBackend::Vault => {
            let vault = config.pki.vault.as_ref().ok_or_else(|| {
                ConfigError::ValidationError(
                    "pki.vault section is required when pki.backend = \"vault\"".to_string(),
                )
            })?;
            if vault.address.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "pki.vault.address cannot be empty".to_string(),
                ));
            }
            if vault.role.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "pki.vault.role cannot be empty".to_string(),
                ));
            }
        }
    }

    match config.ticketing.backend {
        TicketingBackend::ServiceNow => {
            let snow = config.ticketing.servicenow.as_ref().ok_or_else(|| {
                ConfigError::ValidationError(
                    "ticketing.servicenow section is required when ticketing.backend = \"servicenow\""
                        .to_string(),
                )
            })?;
            if snow.instance_url.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "ticketing.servicenow.instance_url cannot be empty".to_string(),
                ));
            }
        }
    }

    let validation = &config.validation;
    if validation.min_ttl_secs == 0 || validation.min_ttl_secs > validation.max_ttl_secs {
        return Err(ConfigError::ValidationError(format!(
            "validation TTL bounds are invalid: min {}s, max {}s",
            validation.min_ttl_secs, validation.max_ttl_secs
        )));
    }
    if validation.default_ttl_secs < validation.min_ttl_secs
        || validation.default_ttl_secs > validation.max_ttl_secs
    {
        return Err(ConfigError::ValidationError(format!(
            "validation.default_ttl_secs ({}) must lie within [{}, {}]",
            validation.default_ttl_secs, validation.min_ttl_secs, validation.max_ttl_secs
        )));
    }
    if validation.default_key_usage.is_empty() {
        return Err(ConfigError::ValidationError(
            "validation.default_key_usage cannot be empty".to_string(),
        ));
    }

    let orchestrator = &config.orchestrator;
    for (name, policy) in [
        ("issuance_retry", &orchestrator.issuance_retry),
        ("ticket_retry", &orchestrator.ticket_retry),
    ] {
        if policy.max_attempts == 0 {
            return Err(ConfigError::ValidationError(format!(
                "orchestrator.{}.max_attempts must be at least 1",
                name
            )));
        }
        if policy.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "orchestrator.{}.backoff_multiplier must be at least 1.0",
                name
            )));
        }
    }
    if orchestrator.sweep_interval_secs == 0 {
        return Err(ConfigError::ValidationError(
            "orchestrator.sweep_interval_secs cannot be 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DatabaseConfig, PkiConfig, ServerConfig, ServiceNowConfig, TicketingConfig,
        ValidationConfig, VaultConfig,
    };
    use crate::orchestrator::OrchestratorConfig;
    use std::net::IpAddr;

    fn valid_config() -> Config {
        Config {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            pki: PkiConfig {
                backend: PkiBackend::Vault,
                vault: Some(VaultConfig {
                    address: "https://vault.internal:8200".to_string(),
                    token: "s.secret".to_string(),
                    namespace: None,
                    mount: "pki".to_string(),
                    role: "web".to_string(),
                    timeout_secs: 30,
                }),
            },
            ticketing: TicketingConfig {
                backend: TicketingBackend::ServiceNow,
                servicenow: Some(ServiceNowConfig {
                    instance_url: "https://example.service-now.com".to_string(),
                    username: "svc".to_string(),
                    password: "pw".to_string(),
                    table: "u_certificate_request".to_string(),
                    timeout_secs: 30,
                }),
            },
            validation: ValidationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let mut config = valid_config();
        config.server = ServerConfig {
            host: "0.0.0.0".parse::<IpAddr>().unwrap(),
            port: 0,
        };
        let result = validate_config(&config);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_missing_backend_section_fails() {
        let mut config = valid_config();
        config.pki.vault = None;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("pki.vault"));

        let mut config = valid_config();
        config.ticketing.servicenow = None;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("ticketing.servicenow"));
    }

    #[test]
    fn test_validate_ttl_bounds() {
        let mut config = valid_config();
        config.validation.min_ttl_secs = 7200;
        config.validation.max_ttl_secs = 3600;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.validation.default_ttl_secs = 60;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_retry_attempts() {
        let mut config = valid_config();
        config.orchestrator.issuance_retry.max_attempts = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("issuance_retry"));
    }
}

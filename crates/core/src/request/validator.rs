//! Normalization and validation of incoming certificate requests.
//!
//! Validation is pure: it never touches storage or a backend, and it either
//! produces a complete `PENDING` record or a [`ValidationError`] naming the
//! offending field.

use std::net::IpAddr;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex_lite::Regex;

use crate::config::ValidationConfig;

use super::types::{
    CertificateRequest, KeyUsage, RawCertificateRequest, RawTtl, RequestedCertificate,
    SubjectAttributes, ValidationError,
};

static DNS_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .unwrap()
});

const DN_ATTRIBUTES: [&str; 9] = [
    "CN",
    "O",
    "OU",
    "C",
    "ST",
    "L",
    "DC",
    "EMAILADDRESS",
    "SERIALNUMBER",
];

const MAX_DNS_NAME_LEN: usize = 253;
const MAX_REQUESTER_LEN: usize = 256;

/// Checks raw requests against the configured bounds.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    config: ValidationConfig,
}

impl RequestValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate and normalize `raw` into a fresh `PENDING` record.
    pub fn validate(&self, raw: RawCertificateRequest) -> Result<CertificateRequest, ValidationError> {
        let requester = validate_requester(raw.requester.as_deref())?;
        let subject_name = validate_subject_name(raw.subject_name.as_deref())?;
        let subject_alt_names = validate_alt_names(&raw.subject_alt_names)?;
        let ttl_secs = self.validate_ttl(raw.ttl.as_ref())?;
        let key_usage = self.validate_key_usage(&raw.key_usage)?;
        let subject = SubjectAttributes {
            organization: non_empty(raw.organization),
            country: validate_country(raw.country)?,
            province: non_empty(raw.province),
            locality: non_empty(raw.locality),
        };

        let requested = RequestedCertificate {
            subject_name,
            subject,
            subject_alt_names,
            ttl_secs,
            key_usage,
        };

        Ok(CertificateRequest::new_pending(
            uuid::Uuid::new_v4().to_string(),
            requester,
            requested,
            Utc::now(),
        ))
    }

    fn validate_ttl(&self, raw: Option<&RawTtl>) -> Result<u64, ValidationError> {
        let secs = match raw {
            None => self.config.default_ttl_secs,
            Some(RawTtl::Hours(hours)) => hours
                .checked_mul(3600)
                .ok_or_else(|| ValidationError::new("ttl", "value is too large"))?,
            Some(RawTtl::Text(text)) => {
                parse_ttl(text).map_err(|reason| ValidationError::new("ttl", reason))?
            }
        };

        if secs < self.config.min_ttl_secs || secs > self.config.max_ttl_secs {
            return Err(ValidationError::new(
                "ttl",
                format!(
                    "must be between {}s and {}s, got {}s",
                    self.config.min_ttl_secs, self.config.max_ttl_secs, secs
                ),
            ));
        }

        Ok(secs)
    }

    fn validate_key_usage(&self, raw: &[String]) -> Result<Vec<KeyUsage>, ValidationError> {
        if raw.is_empty() {
            return Ok(self.config.default_key_usage.clone());
        }

        let mut usages = Vec::with_capacity(raw.len());
        for value in raw {
            let usage = value
                .parse::<KeyUsage>()
                .map_err(|reason| ValidationError::new("key_usage", reason))?;
            if !usages.contains(&usage) {
                usages.push(usage);
            }
        }
        Ok(usages)
    }
}

fn validate_requester(raw: Option<&str>) -> Result<String, ValidationError> {
    let requester = raw.map(str::trim).unwrap_or_default();
    if requester.is_empty() {
        return Err(ValidationError::new("requester", "is required"));
    }
    if requester.len() > MAX_REQUESTER_LEN {
        return Err(ValidationError::new(
            "requester",
            format!("must be at most {} characters", MAX_REQUESTER_LEN),
        ));
    }
    Ok(requester.to_string())
}

fn validate_subject_name(raw: Option<&str>) -> Result<String, ValidationError> {
    let name = raw.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(ValidationError::new("subject_name", "is required"));
    }

    let valid = if name.contains('=') {
        is_distinguished_name(name)
    } else {
        is_dns_name(name)
    };

    if !valid {
        return Err(ValidationError::new(
            "subject_name",
            format!("'{}' is not a valid DNS name or distinguished name", name),
        ));
    }
    Ok(name.to_string())
}

fn validate_alt_names(raw: &[String]) -> Result<Vec<String>, ValidationError> {
    let mut names: Vec<String> = Vec::with_capacity(raw.len());
    for value in raw {
        let value = value.trim();
        if value.parse::<IpAddr>().is_err() && !is_dns_name(value) {
            return Err(ValidationError::new(
                "subject_alt_names",
                format!("'{}' is not a valid DNS name or IP address", value),
            ));
        }
        if !names.iter().any(|n| n.eq_ignore_ascii_case(value)) {
            names.push(value.to_string());
        }
    }
    Ok(names)
}

fn validate_country(raw: Option<String>) -> Result<Option<String>, ValidationError> {
    match non_empty(raw) {
        None => Ok(None),
        Some(country) => {
            if country.len() == 2 && country.chars().all(|c| c.is_ascii_alphabetic()) {
                Ok(Some(country.to_ascii_uppercase()))
            } else {
                Err(ValidationError::new(
                    "country",
                    "must be a two-letter ISO country code",
                ))
            }
        }
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Whether `name` is a syntactically valid DNS name, optionally with a
/// leading `*.` wildcard label.
pub fn is_dns_name(name: &str) -> bool {
    let host = name.strip_prefix("*.").unwrap_or(name);
    !host.is_empty() && name.len() <= MAX_DNS_NAME_LEN && DNS_NAME.is_match(host)
}

/// Whether `name` is a comma separated list of `KEY=value` pairs using known
/// attribute keys, containing at least one `CN`.
pub fn is_distinguished_name(name: &str) -> bool {
    let mut has_cn = false;
    for part in name.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return false;
        };
        let key = key.trim().to_ascii_uppercase();
        if !DN_ATTRIBUTES.contains(&key.as_str()) || value.trim().is_empty() {
            return false;
        }
        if key == "CN" {
            has_cn = true;
        }
    }
    has_cn
}

/// Common name carried by a subject: the `CN` of a distinguished name, or
/// the DNS name itself.
pub fn common_name(subject_name: &str) -> &str {
    if !subject_name.contains('=') {
        return subject_name;
    }
    subject_name
        .split(',')
        .filter_map(|part| part.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("CN"))
        .map(|(_, value)| value.trim())
        .unwrap_or(subject_name)
}

/// Parse a TTL such as `24h`, `30m`, `7d`, `3600s`, or a bare number of hours.
pub fn parse_ttl(text: &str) -> Result<u64, String> {
    let text = text.trim().to_ascii_lowercase();
    if text.is_empty() {
        return Err("must not be empty".to_string());
    }

    let (digits, multiplier) = match text.char_indices().last() {
        Some((idx, 's')) => (&text[..idx], 1),
        Some((idx, 'm')) => (&text[..idx], 60),
        Some((idx, 'h')) => (&text[..idx], 3600),
        Some((idx, 'd')) => (&text[..idx], 86_400),
        _ => (text.as_str(), 3600),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a duration like 24h, 30m, 7d or 3600s", text))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| "value is too large".to_string())
}

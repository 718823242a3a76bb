//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check addresses parse as host:port
//! - Check TLS file paths are present when TLS is configured
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function: HarnessConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use crate::config::schema::HarnessConfig;

/// A single semantic validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// Human-readable description.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting every failure.
pub fn validate_config(config: &HarnessConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&config.listener.bind_address, "listener.bind_address", &mut errors);

    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() {
            errors.push(ValidationError {
                field: "listener.tls.cert_path".into(),
                message: "certificate path must not be empty".into(),
            });
        }
        if tls.key_path.is_empty() {
            errors.push(ValidationError {
                field: "listener.tls.key_path".into(),
                message: "private key path must not be empty".into(),
            });
        }
    }

    if let Some(proxy) = &config.proxy {
        check_addr(&proxy.bind_address, "proxy.bind_address", &mut errors);
        if let Some(target) = &proxy.target {
            check_addr(target, "proxy.target", &mut errors);
        }
        if let Some(auth) = &proxy.auth {
            if !auth.scheme.eq_ignore_ascii_case("basic") {
                errors.push(ValidationError {
                    field: "proxy.auth.scheme".into(),
                    message: format!("unsupported scheme '{}'", auth.scheme),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(addr: &str, field: &str, errors: &mut Vec<ValidationError>) {
    if addr.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError {
            field: field.to_string(),
            message: format!("'{}' is not a valid host:port address", addr),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ProxyAuthConfig, ProxyConfig};

    #[test]
    fn default_config_validates() {
        assert!(validate_config(&HarnessConfig::default()).is_ok());
    }

    #[test]
    fn bad_address_rejected() {
        let mut config = HarnessConfig::default();
        config.listener.bind_address = "not-an-address".into();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "listener.bind_address");
    }

    #[test]
    fn all_errors_collected() {
        let mut config = HarnessConfig::default();
        config.listener.bind_address = "bad".into();
        config.proxy = Some(ProxyConfig {
            bind_address: "also-bad".into(),
            target: None,
            auth: Some(ProxyAuthConfig {
                scheme: "NTLM".into(),
                username: "u".into(),
                password: "p".into(),
            }),
        });
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
    }
}

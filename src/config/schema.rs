//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the harness.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the harness.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Optional proxy engine configuration.
    pub proxy: Option<ProxyConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:0").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for a listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Proxy engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bind address for the proxy listener.
    pub bind_address: String,

    /// Upstream target for non-CONNECT proxied requests
    /// (e.g., "127.0.0.1:8080"). CONNECT requests carry their own target.
    pub target: Option<String>,

    /// Optional proxy authentication.
    pub auth: Option<ProxyAuthConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            target: None,
            auth: None,
        }
    }
}

/// Credentials the proxy requires via Proxy-Authorization.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyAuthConfig {
    /// Authentication scheme name; "Basic" is the only built-in scheme.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    pub username: String,
    pub password: String,
}

fn default_scheme() -> String {
    "Basic".to_string()
}

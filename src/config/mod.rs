//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) or embedding test code
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → HarnessConfig (validated, immutable)
//!     → handed to Listener::bind / ProxyServer::bind
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the harness is embeddable, so most
//!   callers build a `HarnessConfig` in code rather than from a file
//! - All fields have defaults to allow minimal configs
//! - Bind addresses are explicit host:port, never environment-driven

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::HarnessConfig;
pub use schema::ListenerConfig;
pub use schema::ProxyAuthConfig;
pub use schema::ProxyConfig;
pub use schema::TlsConfig;

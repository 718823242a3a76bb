//! Forward proxy subsystem: CONNECT tunnels, request forwarding, and the
//! credential checks shared with the listener's auth handlers.

pub mod auth;
pub mod server;
pub mod tunnel;

pub use auth::{AuthDecision, AuthScheme, AuthenticationManager, BasicAuth};
pub use server::ProxyServer;
pub use tunnel::{relay, TunnelStats};

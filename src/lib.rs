//! Embeddable HTTP/TLS harness server and proxy engine.
//!
//! The crate accepts real TCP (optionally TLS) connections, drives each one
//! through a per-connection request/response state machine with keep-alive
//! and redirect support, and in proxy mode establishes CONNECT tunnels that
//! relay opaque bytes in both directions. A stream instrumentation layer
//! lets test code intercept exactly one read on a live socket to inject
//! delay, truncation, or corruption at a precise point in an exchange.

pub mod config;
pub mod error;
pub mod http;
pub mod listener;
pub mod net;
pub mod observability;
pub mod proxy;

pub use config::schema::HarnessConfig;
pub use error::HarnessError;
pub use http::{HttpRequest, HttpResponse, Method, Status, Version};
pub use listener::{
    Handler, HandlerAction, Listener, ListenerContext, Operation, OperationFlags,
    OperationOutcome,
};
pub use net::connection::Connection;
pub use net::instrument::{InstrumentationHandle, ReadHook};
pub use proxy::ProxyServer;

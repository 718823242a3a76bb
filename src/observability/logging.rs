//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber for embedding binaries and tests
//! - Keep initialization idempotent so parallel tests can all call it

use tracing_subscriber::EnvFilter;

/// Initialize the logging subsystem.
///
/// Reads the filter from `RUST_LOG`, defaulting to `info` for this crate.
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("http_harness=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

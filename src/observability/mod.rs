//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!
//! Consumers:
//!     → stdout (embedding test harness captures it)
//! ```
//!
//! # Design Decisions
//! - Structured logging only; metrics/exporters are out of scope for the
//!   harness core
//! - Log level configurable via RUST_LOG
//! - Diagnostics never affect control flow; a silent subscriber is fine

pub mod logging;

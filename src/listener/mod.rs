//! Listener subsystem: the per-connection state machine and its driver.
//!
//! # Data Flow
//! ```text
//! Operation registered (path → registry)
//!     → find_or_create_context claims an idle pooled context or accepts
//!     → context.rs drives Listening/Reuse → WaitingForRequest →
//!       HasRequest → RequestComplete
//!     → handler.rs produces the response (or a redirect)
//!     → continue_or_retire pools the connection for keep-alive reuse
//! ```
//!
//! # Design Decisions
//! - One mutex per listener guards the reuse pool and the path registry;
//!   it is never held across an I/O await
//! - Claiming an idle context is an atomic compare-and-swap so two
//!   operations can never share one
//! - A reused connection always gets a fresh context instance; per-session
//!   state never bleeds across sessions

pub mod context;
pub mod handler;
pub mod listener;
pub mod operation;

pub use context::{ConnectionState, ListenerContext, SessionOutcome};
pub use handler::{
    AuthChallengeHandler, Handler, HandlerAction, HelloHandler, PeerInfo, PostEchoHandler,
    RedirectHandler,
};
pub use listener::Listener;
pub use operation::{
    ClientObservation, ClaimSlot, Operation, OperationFlags, OperationOutcome, PendingRedirect,
    RedirectSlot,
};

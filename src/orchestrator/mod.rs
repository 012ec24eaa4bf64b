//! Session orchestration modules.
//!
//! Covers the start-up handshake, the per-session event consumer, the
//! session state machine, and the registry of concurrent sessions.

pub mod events;
pub mod handshake;
pub mod registry;
pub mod session;

pub use handshake::{BreakpointRequest, SessionRequest, StartRequest};
pub use registry::SessionRegistry;
pub use session::{DebugSession, SessionSettings};

//! Debug Adapter Protocol plumbing.
//!
//! Leaves first: the message envelope, the Content-Length frame codec, the
//! byte-stream transports, and the client engine that correlates requests
//! with responses and fans out events.

pub mod client;
pub mod codec;
pub mod message;
pub mod spawner;
pub mod transport;

pub use client::{DapClient, EventStream, PendingResponse};
pub use message::{Event, Message, Request, Response};
pub use transport::{AdapterEndpoint, ListenArg, OpenOptions, Transport};

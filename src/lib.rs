#![forbid(unsafe_code)]

//! Bridge that drives concurrent Debug Adapter Protocol sessions from a
//! single controller.

pub mod adapters;
pub mod config;
pub mod dap;
pub mod errors;
pub mod models;
pub mod orchestrator;

pub use config::BridgeConfig;
pub use errors::{AppError, Result};
pub use orchestrator::{DebugSession, SessionRegistry};

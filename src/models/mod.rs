//! Domain model module declarations.

pub mod debug;
pub mod session;

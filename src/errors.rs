//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

/// Shared result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of the bridge.
///
/// Connection-fatal kinds ([`AppError::Framing`], [`AppError::TransportClosed`])
/// end the owning session; the remaining kinds are local to one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Malformed frame header or body on the wire.
    Framing(String),
    /// The byte stream ended or was closed; carries the cause.
    TransportClosed(String),
    /// The adapter answered a request with `success: false`.
    Adapter {
        /// Human-readable failure text reported by the adapter.
        message: String,
        /// Adapter-specific error identifier, when supplied.
        code: Option<i64>,
    },
    /// Operation is not valid in the session's current state.
    InvalidState(String),
    /// No session is registered under the identifier.
    SessionNotFound(String),
    /// The session has terminated; no further work is accepted.
    SessionTerminated(String),
    /// A bounded wait elapsed.
    Timeout(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// Spawn, connect or other OS-level failure.
    Io(String),
}

impl AppError {
    /// Whether this error ends the connection it was raised on.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Framing(_) | Self::TransportClosed(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Framing(msg) => write!(f, "framing: {msg}"),
            Self::TransportClosed(msg) => write!(f, "transport closed: {msg}"),
            Self::Adapter {
                message,
                code: Some(code),
            } => write!(f, "adapter: {message} (code {code})"),
            Self::Adapter {
                message,
                code: None,
            } => write!(f, "adapter: {message}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            Self::SessionTerminated(msg) => write!(f, "session terminated: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Framing(format!("invalid message body: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

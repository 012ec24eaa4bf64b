//! Debug Adapter Protocol message envelope.
//!
//! Every frame body is one JSON object tagged by its `type` field. Field
//! names follow the published DAP schema; fields this crate does not model
//! are ignored on decode, and bodies/arguments are kept as opaque
//! [`serde_json::Value`]s so new protocol versions pass through untouched.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::AppError;

/// One protocol message, discriminated by the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Client → adapter command, or an adapter reverse request.
    Request(Request),
    /// Answer to a previously issued request.
    Response(Response),
    /// Unsolicited notification.
    Event(Event),
}

impl Message {
    /// Sender-assigned sequence number of this message.
    #[must_use]
    pub fn seq(&self) -> i64 {
        match self {
            Self::Request(req) => req.seq,
            Self::Response(resp) => resp.seq,
            Self::Event(event) => event.seq,
        }
    }

    /// Short kind label used in log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Event(_) => "event",
        }
    }
}

/// A command sent to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Sequence number assigned by the sender.
    pub seq: i64,
    /// Command name, e.g. `setBreakpoints`.
    pub command: String,
    /// Command-specific arguments.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Sequence number assigned by the sender.
    pub seq: i64,
    /// Sequence number of the request this answers.
    pub request_seq: i64,
    /// Whether the request succeeded.
    pub success: bool,
    /// Command name echoed from the request.
    pub command: String,
    /// Short failure text when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result payload, or a structured error payload on failure.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    /// Convert a response into its result payload or an [`AppError::Adapter`].
    ///
    /// The error text prefers the structured `body.error.format` over the
    /// short `message`; the code comes from `body.error.id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Adapter`] when `success` is false.
    pub fn into_result(self) -> Result<Value, AppError> {
        if self.success {
            return Ok(self.body.unwrap_or(Value::Null));
        }

        let detail = self.body.as_ref().and_then(|body| body.get("error"));
        let code = detail.and_then(|err| err.get("id")).and_then(Value::as_i64);
        let formatted = detail
            .and_then(|err| err.get("format"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let message = formatted
            .or(self.message)
            .unwrap_or_else(|| format!("'{}' failed", self.command));

        Err(AppError::Adapter { message, code })
    }
}

/// An unsolicited notification from the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Sequence number assigned by the sender.
    pub seq: i64,
    /// Event type tag, e.g. `stopped`. Unknown tags are kept verbatim.
    pub event: String,
    /// Event-specific payload.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    /// Read a string field from the event body.
    #[must_use]
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.as_ref()?.get(key)?.as_str()
    }

    /// Read an integer field from the event body.
    #[must_use]
    pub fn body_i64(&self, key: &str) -> Option<i64> {
        self.body.as_ref()?.get(key)?.as_i64()
    }
}

/// An explicit `null` payload stays `Some(Value::Null)`; only an absent
/// field decodes as `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

//! # Error Definitions
//!
//! Two families live here:
//!
//! - [`CallError`]: the terminal outcome of a single call, either produced locally
//!   (send failure, timeout, disconnect, malformed reply) or sent by the peer as
//!   the `error` half of a reply. It is a value, it travels on the wire.
//! - [`Error`]: failures to encode or decode frames and envelopes.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The `type` tag of a [`CallError`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    /// The transport rejected the call before it left.
    SendError,
    /// No reply arrived within the allowed window.
    Timeout,
    /// The connection died while the call was outstanding.
    Disconnect,
    /// The peer has no handler for the invoked method.
    MethodNotFound,
    /// The reply did not contain a decodable result or error.
    InvalidResponse,
    /// Any type tag defined by the application on the other side.
    Other(String),
}

impl ErrorKind {
    pub fn as_tag(&self) -> &str {
        match self {
            Self::SendError => "sendError",
            Self::Timeout => "timeout",
            Self::Disconnect => "disconnect",
            Self::MethodNotFound => "methodNotFound",
            Self::InvalidResponse => "invalidResponse",
            Self::Other(tag) => tag,
        }
    }
}

impl From<String> for ErrorKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "sendError" => Self::SendError,
            "timeout" => Self::Timeout,
            "disconnect" => Self::Disconnect,
            "methodNotFound" => Self::MethodNotFound,
            "invalidResponse" => Self::InvalidResponse,
            _ => Self::Other(tag),
        }
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Other(tag) => tag,
            other => other.as_tag().to_string(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Structured call error, wire form `{type, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    #[serde(default)]
    pub message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn send_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SendError, message)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "did not get the response in allowed time")
    }

    pub fn disconnect() -> Self {
        Self::new(ErrorKind::Disconnect, "remote peer has disconnected")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorKind::MethodNotFound, format!("method not found: {}", method))
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResponse, message)
    }

    pub fn is(&self, kind: &ErrorKind) -> bool {
        &self.kind == kind
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CallError {}

/// Failures to build or parse frames and envelopes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame decoded but does not have the expected shape.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for gossamer-node.
//!
//! Two layers live here. [`Error`] is the local failure type returned by the
//! runtime's own operations. [`RpcError`] is the structured protocol error that
//! travels on the wire as `{"type": "error", "code": .., "text": ..}`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for gossamer-node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the node runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading the input channel or writing the output channel failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An input line could not be decoded as an envelope with a well-formed body.
    #[error("malformed message {line:?}: {reason}")]
    Malformed { line: String, reason: String },

    /// A request arrived whose type has no registered handler.
    #[error("no handler for message type {msg_type:?}")]
    NoHandler { msg_type: String },

    /// A second handler was registered for the same message type.
    #[error("duplicate message handler for {0:?} message type")]
    DuplicateHandler(String),

    /// `initialize` was called on a node that already has an identity.
    #[error("node already initialized")]
    AlreadyInitialized,

    /// An operation that needs the node identity ran before the init handshake.
    #[error("node not initialized")]
    NotInitialized,

    /// A message body did not serialize to a JSON object.
    #[error("invalid message body: {0}")]
    InvalidBody(String),

    /// The remote side (or a handler) reported a structured protocol error.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// No reply arrived within the caller's deadline.
    #[error("RPC timeout after {0:?}")]
    Timeout(Duration),

    /// The pending reply slot was dropped before a reply was delivered.
    #[error("reply channel dropped before a reply arrived")]
    ReplyDropped,
}

impl Error {
    /// Convert this error into the protocol error sent back to a requester.
    ///
    /// Structured errors pass through unchanged; everything else becomes a
    /// generic [`ErrorCode::Crash`].
    pub fn into_rpc_error(self) -> RpcError {
        match self {
            Error::Rpc(e) => e,
            Error::Malformed { reason, .. } => RpcError::new(ErrorCode::MalformedRequest, reason),
            timeout @ Error::Timeout(_) => RpcError::new(ErrorCode::Timeout, timeout.to_string()),
            other => RpcError::crash(other.to_string()),
        }
    }
}

/// Standard protocol error codes.
///
/// Codes below 1000 are reserved by the protocol; anything the runtime does
/// not recognize decodes as [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum ErrorCode {
    /// The requested operation timed out.
    Timeout,
    /// The destination node does not exist.
    NodeNotFound,
    /// The requested operation is not supported by this node.
    NotSupported,
    /// The operation definitely did not happen; retry later.
    TemporarilyUnavailable,
    /// The request was not understood.
    MalformedRequest,
    /// The handler failed in an unexpected way; the outcome is indeterminate.
    Crash,
    /// The operation definitely did not happen.
    Abort,
    /// The key does not exist.
    KeyDoesNotExist,
    /// The key already exists.
    KeyAlreadyExists,
    /// A precondition (such as compare-and-set) did not hold.
    PreconditionFailed,
    /// A transaction was aborted due to a conflict.
    TxnConflict,
    /// Any other code.
    Other(u32),
}

impl ErrorCode {
    /// Numeric wire value.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Timeout => 0,
            Self::NodeNotFound => 1,
            Self::NotSupported => 10,
            Self::TemporarilyUnavailable => 11,
            Self::MalformedRequest => 12,
            Self::Crash => 13,
            Self::Abort => 14,
            Self::KeyDoesNotExist => 20,
            Self::KeyAlreadyExists => 21,
            Self::PreconditionFailed => 22,
            Self::TxnConflict => 30,
            Self::Other(code) => code,
        }
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0 => Self::Timeout,
            1 => Self::NodeNotFound,
            10 => Self::NotSupported,
            11 => Self::TemporarilyUnavailable,
            12 => Self::MalformedRequest,
            13 => Self::Crash,
            14 => Self::Abort,
            20 => Self::KeyDoesNotExist,
            21 => Self::KeyAlreadyExists,
            22 => Self::PreconditionFailed,
            30 => Self::TxnConflict,
            other => Self::Other(other),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::NodeNotFound => write!(f, "node-not-found"),
            Self::NotSupported => write!(f, "not-supported"),
            Self::TemporarilyUnavailable => write!(f, "temporarily-unavailable"),
            Self::MalformedRequest => write!(f, "malformed-request"),
            Self::Crash => write!(f, "crash"),
            Self::Abort => write!(f, "abort"),
            Self::KeyDoesNotExist => write!(f, "key-does-not-exist"),
            Self::KeyAlreadyExists => write!(f, "key-already-exists"),
            Self::PreconditionFailed => write!(f, "precondition-failed"),
            Self::TxnConflict => write!(f, "txn-conflict"),
            Self::Other(code) => write!(f, "error-{}", code),
        }
    }
}

/// A structured protocol error: an error code plus human-readable text.
///
/// Returning `Err(Error::Rpc(..))` from a handler makes the runtime reply with
/// this error instead of a generic crash.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} (code {}): {text}", .code.code())]
pub struct RpcError {
    pub code: ErrorCode,
    pub text: String,
}

impl RpcError {
    /// Create a new protocol error.
    pub fn new(code: ErrorCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Generic fault raised when a handler fails without a structured error.
    pub fn crash(text: impl Into<String>) -> Self {
        Self::new(ErrorCode::Crash, text)
    }

    /// The wire body for this error, without `in_reply_to`.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "code": self.code,
            "text": self.text,
        })
    }
}

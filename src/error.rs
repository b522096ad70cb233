//! Error types for the dispatcher, the gateway session, and the client facade.
//!
//! Throttling never appears here: it is retried inside the bucket worker and is invisible to
//! callers. Everything else surfaces exactly once with enough detail for the caller to decide
//! on its own retry.

use std::time::Duration;

/// Faults raised by an injected transport.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The connection broke while the call was in progress.
    #[error("i/o error: {0}")]
    Io(String),
    /// The call did not finish within its timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

/// Outcome failures delivered to a request's submitter.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Non-throttling 4xx response.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        status: u16,
        /// Service-specific error code from the response body, when present.
        code: Option<u64>,
        message: String,
    },
    /// 5xx response.
    #[error("server error (status {status})")]
    Server { status: u16 },
    /// Connection refused, reset, or timed out.
    #[error("transport fault: {0}")]
    TransportFault(#[from] TransportError),
    /// The request's cancellation scope fired before completion.
    #[error("request cancelled")]
    Cancelled,
    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl DispatchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Self::TransportFault(_))
    }

    /// HTTP-style status carried by the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } | Self::Server { status } => Some(*status),
            _ => None,
        }
    }
}

/// A single inbound frame that could not be decoded. The frame is dropped and the session
/// keeps running.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFault {
    #[error("failed to inflate frame: {0}")]
    Decompress(String),
    #[error("malformed frame: {0}")]
    Json(String),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("unexpected frame: {0}")]
    Unexpected(String),
}

/// Failures reported by the gateway session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is already running")]
    AlreadyRunning,
    #[error("session is not connected")]
    NotConnected,
    #[error("no gateway url configured")]
    MissingGatewayUrl,
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("dispatch: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("frame: {0}")]
    Protocol(#[from] ProtocolFault),
    /// The service refused the session; no reconnect is attempted.
    #[error("session closed by service ({code}): {reason}")]
    Fatal { code: u16, reason: String },
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl SessionError {
    /// Whether the session stopped for good and needs an explicit `connect` to retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Errors returned by the typed client facade.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Arguments rejected before anything was sent.
    #[error("invalid argument: {0}")]
    Validation(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_accessors() {
        let rejected =
            DispatchError::Rejected { status: 404, code: Some(10003), message: "nope".into() };
        assert!(rejected.is_rejected());
        assert_eq!(rejected.status(), Some(404));
        assert_eq!(DispatchError::Server { status: 502 }.status(), Some(502));
        assert!(DispatchError::Cancelled.is_cancelled());
        assert_eq!(DispatchError::Cancelled.status(), None);

        let fault: DispatchError = TransportError::Closed.into();
        assert!(fault.is_transport_fault());
    }

    #[test]
    fn display_messages() {
        let rejected =
            DispatchError::Rejected { status: 403, code: None, message: "Missing Access".into() };
        assert_eq!(rejected.to_string(), "request rejected (403): Missing Access");

        let fatal = SessionError::Fatal { code: 4004, reason: "authentication failed".into() };
        assert_eq!(fatal.to_string(), "session closed by service (4004): authentication failed");
        assert!(fatal.is_fatal());

        let wrapped: ClientError = DispatchError::Cancelled.into();
        assert_eq!(wrapped.to_string(), "request cancelled");
    }
}

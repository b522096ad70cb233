use std::fmt;
use std::time::Duration;

use crate::bucket::BucketKey;
use crate::frame::OpCode;
use crate::session::SessionState;

/// Events emitted by the dispatcher and the gateway session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Request dispatcher events
    Dispatch(DispatchEvent),
    /// Gateway session events
    Session(SessionEvent),
}

/// Events emitted by the request dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A throttling response was received; the request will be retried.
    RateLimited {
        bucket: BucketKey,
        retry_after: Duration,
        /// The pause applies to every bucket.
        global: bool,
    },
    /// A request left its bucket with an outcome.
    Completed {
        bucket: BucketKey,
        /// Status of the last response, if the transport produced one.
        status: Option<u16>,
        succeeded: bool,
        /// Time from submission to outcome, including queueing.
        elapsed: Duration,
    },
    /// All buckets were cleared and their work cancelled.
    Drained { buckets: usize },
}

/// Events emitted by the gateway session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: SessionState, to: SessionState },
    /// A control frame was handed to the connection.
    FrameSent { op: OpCode },
    /// Round trip between a heartbeat and its acknowledgement.
    LatencyUpdated { latency: Duration },
    /// An inbound frame was dropped.
    FrameDropped { reason: String },
    /// The connection was lost; the next attempt starts after `delay`.
    Reconnecting { delay: Duration, failures: usize },
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEvent::Dispatch(event) => write!(f, "Dispatch::{}", event),
            ClientEvent::Session(event) => write!(f, "Session::{}", event),
        }
    }
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::RateLimited { bucket, retry_after, global } => {
                write!(f, "RateLimited({}, retry_after={:?}, global={})", bucket, retry_after, global)
            }
            DispatchEvent::Completed { bucket, status, succeeded, elapsed } => {
                let status = status.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                write!(
                    f,
                    "Completed({}, status={}, ok={}, elapsed={:?})",
                    bucket, status, succeeded, elapsed
                )
            }
            DispatchEvent::Drained { buckets } => write!(f, "Drained(buckets={})", buckets),
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::StateChanged { from, to } => {
                write!(f, "StateChanged({:?} -> {:?})", from, to)
            }
            SessionEvent::FrameSent { op } => write!(f, "FrameSent({:?})", op),
            SessionEvent::LatencyUpdated { latency } => {
                write!(f, "LatencyUpdated({:?})", latency)
            }
            SessionEvent::FrameDropped { reason } => write!(f, "FrameDropped({})", reason),
            SessionEvent::Reconnecting { delay, failures } => {
                write!(f, "Reconnecting(delay={:?}, failures={})", delay, failures)
            }
        }
    }
}

impl From<DispatchEvent> for ClientEvent {
    fn from(event: DispatchEvent) -> Self {
        ClientEvent::Dispatch(event)
    }
}

impl From<SessionEvent> for ClientEvent {
    fn from(event: SessionEvent) -> Self {
        ClientEvent::Session(event)
    }
}

//! Telemetry for the dispatcher and the gateway session.
//!
//! Events flow through `TelemetrySink` implementations, which are plain
//! `tower::Service<ClientEvent>`s, so any tower middleware can sit in front of a sink.
//!
//! # Event Types
//!
//! - **Dispatch**: `RateLimited`, `Completed`, `Drained`
//! - **Session**: `StateChanged`, `FrameSent`, `LatencyUpdated`, `FrameDropped`, `Reconnecting`
//!
//! Emission is best-effort: a sink that errors or is not ready never affects a request or
//! the session.

pub mod events;
pub mod sinks;

use std::fmt;
use std::sync::Mutex;

use tower::util::BoxCloneService;
use tower::{BoxError, ServiceExt};

pub use events::{ClientEvent, DispatchEvent, SessionEvent};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};

type BoxedSink = BoxCloneService<ClientEvent, (), BoxError>;

/// Type-erased sink shared by a dispatcher or a session.
pub struct Telemetry {
    sink: Mutex<BoxedSink>,
}

impl Telemetry {
    pub fn new<S>(sink: S) -> Self
    where
        S: tower::Service<ClientEvent, Response = ()> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        Self { sink: Mutex::new(BoxCloneService::new(sink.map_err(Into::into))) }
    }

    pub fn null() -> Self {
        Self::new(NullSink)
    }

    pub async fn emit(&self, event: impl Into<ClientEvent>) {
        let sink = self.sink.lock().unwrap_or_else(|p| p.into_inner()).clone();
        emit_best_effort(sink, event.into()).await;
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::null()
    }
}

impl Clone for Telemetry {
    fn clone(&self) -> Self {
        let sink = self.sink.lock().unwrap_or_else(|p| p.into_inner()).clone();
        Self { sink: Mutex::new(sink) }
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boxed_sink_forwards_to_inner() {
        let memory = MemorySink::new();
        let telemetry = Telemetry::new(memory.clone());
        telemetry.emit(DispatchEvent::Drained { buckets: 3 }).await;
        telemetry.clone().emit(DispatchEvent::Drained { buckets: 4 }).await;
        assert_eq!(memory.len(), 2);
    }
}

use super::events::{ClientEvent, DispatchEvent, SessionEvent};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

type Ready = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A telemetry sink that consumes client events.
pub trait TelemetrySink:
    tower::Service<ClientEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: ClientEvent)
where
    S: tower::Service<ClientEvent, Response = ()> + Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<ClientEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: ClientEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Throttling, dropped frames and reconnects are logged at `warn`; state changes at `info`;
/// per-request and per-frame traffic at `debug`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<ClientEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        match &event {
            ClientEvent::Dispatch(DispatchEvent::RateLimited { .. })
            | ClientEvent::Session(SessionEvent::FrameDropped { .. })
            | ClientEvent::Session(SessionEvent::Reconnecting { .. }) => {
                tracing::warn!(event = %event, "client_event")
            }
            ClientEvent::Dispatch(DispatchEvent::Drained { .. })
            | ClientEvent::Session(SessionEvent::StateChanged { .. }) => {
                tracing::info!(event = %event, "client_event")
            }
            _ => tracing::debug!(event = %event, "client_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ClientEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<ClientEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.guard().clone()
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ClientEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ClientEvent) -> Self::Future {
        let mut guard = self.guard();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

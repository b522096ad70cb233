//! Rate-limited request dispatcher.
//!
//! One worker task per [`BucketKey`], started lazily on first use. A worker owns its bucket's
//! queue (an unbounded channel) and its [`BucketState`], and runs one request at a time, so
//! completions within a bucket follow submission order while unrelated buckets proceed in
//! parallel. The [`GlobalGate`] is the only rate-limit state shared between workers.
//!
//! Throttling responses are retried from the head of the queue without the caller noticing.
//! Every other failure is delivered once, as a [`DispatchError`].
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use bucketline::{BucketKey, Dispatcher, Request, RestRequest, RouteGroup, Verb};
//! # async fn demo(transport: Arc<dyn bucketline::RestTransport>) {
//! let dispatcher = Dispatcher::new(transport);
//! let key = BucketKey::owned(RouteGroup::OwnerSendEditMessage, 42);
//! let request = RestRequest::new(Verb::Post, "channels/7/messages").with_body(b"{}".to_vec());
//! let response = dispatcher.submit(key, Request::Rest(request)).await;
//! # let _ = response;
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::BucketKey;
use crate::clock::{Clock, MonotonicClock};
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, TransportError};
use crate::frame::OpCode;
use crate::rate_limit::{BucketSnapshot, BucketState, Decision, GlobalGate, RateLimitInfo};
use crate::scope::{CancellationScope, RequestScope};
use crate::telemetry::{DispatchEvent, Telemetry};
use crate::transport::{FrameSink, RawResponse, RestRequest, RestTransport};

/// An outbound gateway frame routed through a bucket.
#[derive(Clone)]
pub struct FrameRequest {
    pub op: OpCode,
    pub payload: Vec<u8>,
    pub sink: Arc<dyn FrameSink>,
}

impl fmt::Debug for FrameRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRequest")
            .field("op", &self.op)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// One unit of work.
#[derive(Debug, Clone)]
pub enum Request {
    Rest(RestRequest),
    Frame(FrameRequest),
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Response body, for the caller to decode.
    Body(Vec<u8>),
    /// Status and metadata only, for header-only requests.
    Headers { status: u16, rate_limit: RateLimitInfo },
    /// The frame was handed to the connection.
    Sent,
}

impl Response {
    pub fn into_body(self) -> Vec<u8> {
        match self {
            Response::Body(body) => body,
            Response::Headers { .. } | Response::Sent => Vec::new(),
        }
    }
}

/// Per-submission overrides.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Extra token that cancels this request, on top of the dispatcher's ambient scope.
    pub scope: Option<CancellationToken>,
    /// Bound on each transport call; defaults to the configured request timeout.
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn with_scope(mut self, scope: CancellationToken) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

type Reply = oneshot::Sender<Result<Response, DispatchError>>;

struct Job {
    request: Request,
    scope: RequestScope,
    timeout: Duration,
    reply: Reply,
    submitted_at: Instant,
}

/// Queue handle for one bucket plus the state its worker last published.
struct BucketHandle {
    queue: mpsc::UnboundedSender<Job>,
    state: watch::Receiver<BucketState>,
}

/// State shared with the bucket workers. Holds no reference back to the bucket map, so
/// workers stop once the dispatcher and its queues are gone.
struct Shared {
    transport: Arc<dyn RestTransport>,
    gate: GlobalGate,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    telemetry: Telemetry,
}

struct Inner {
    shared: Arc<Shared>,
    buckets: Mutex<HashMap<BucketKey, BucketHandle>>,
    scope: CancellationScope,
}

/// Cloneable handle to one dispatcher instance.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("buckets", &self.bucket_count())
            .field("config", &self.inner.shared.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    transport: Arc<dyn RestTransport>,
    config: DispatcherConfig,
    telemetry: Telemetry,
    clock: Arc<dyn Clock>,
    scope: CancellationToken,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Clock for rate-limit bookkeeping. Any epoch works; it must advance with tokio time,
    /// since waits are tokio sleeps for the difference between two readings.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Initial ambient cancellation scope.
    pub fn cancellation_scope(mut self, scope: CancellationToken) -> Self {
        self.scope = scope;
        self
    }

    pub fn build(self) -> Dispatcher {
        let shared = Shared {
            transport: self.transport,
            gate: GlobalGate::new(),
            clock: self.clock,
            config: self.config,
            telemetry: self.telemetry,
        };
        Dispatcher {
            inner: Arc::new(Inner {
                shared: Arc::new(shared),
                buckets: Mutex::new(HashMap::new()),
                scope: CancellationScope::new(self.scope),
            }),
        }
    }
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn RestTransport>) -> Self {
        Self::builder(transport).build()
    }

    pub fn builder(transport: Arc<dyn RestTransport>) -> DispatcherBuilder {
        DispatcherBuilder {
            transport,
            config: DispatcherConfig::default(),
            telemetry: Telemetry::null(),
            clock: Arc::new(MonotonicClock::default()),
            scope: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.shared.config
    }

    /// Enqueue `request` on the bucket for `key` and wait for its outcome.
    ///
    /// The request is queued when this is called, not when the future is first polled.
    /// Dropping the future abandons the request; if it has not been dispatched yet it is
    /// skipped.
    pub fn submit(
        &self,
        key: BucketKey,
        request: Request,
    ) -> impl Future<Output = Result<Response, DispatchError>> + Send + 'static {
        self.submit_with(key, request, SubmitOptions::default())
    }

    pub fn submit_with(
        &self,
        key: BucketKey,
        request: Request,
        options: SubmitOptions,
    ) -> impl Future<Output = Result<Response, DispatchError>> + Send + 'static {
        let (reply, outcome) = oneshot::channel();
        self.enqueue(key, request, options, reply);
        async move { outcome.await.unwrap_or(Err(DispatchError::Cancelled)) }
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<BucketKey, BucketHandle>> {
        self.inner.buckets.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enqueue(&self, key: BucketKey, request: Request, options: SubmitOptions, reply: Reply) {
        let mut buckets = self.buckets();
        let job = Job {
            request,
            scope: RequestScope::new(self.inner.scope.current(), options.scope),
            timeout: options.timeout.unwrap_or_else(|| self.inner.shared.config.request_timeout()),
            reply,
            submitted_at: Instant::now(),
        };
        let handle = buckets
            .entry(key)
            .or_insert_with(|| spawn_worker(self.inner.shared.clone(), key));
        let job = match handle.queue.send(job) {
            Ok(()) => return,
            Err(mpsc::error::SendError(job)) => job,
        };
        // the worker is gone (it panicked); start over with a fresh bucket
        warn!(bucket = %key, "bucket worker stopped unexpectedly; restarting");
        let handle = spawn_worker(self.inner.shared.clone(), key);
        let _ = handle.queue.send(job);
        buckets.insert(key, handle);
    }

    /// Cancel every queued and in-flight request and forget all bucket state.
    ///
    /// Idempotent. The dispatcher stays usable: later submissions start fresh buckets under
    /// a fresh scope derived from the same parent.
    pub fn drain_and_cancel(&self) {
        let drained = {
            let mut buckets = self.buckets();
            self.inner.scope.drain();
            std::mem::take(&mut *buckets)
        };
        let count = drained.len();
        drop(drained);
        info!(buckets = count, "dispatcher drained");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = self.inner.shared.clone();
            runtime.spawn(async move {
                shared.telemetry.emit(DispatchEvent::Drained { buckets: count }).await;
            });
        }
    }

    /// Replace the ambient cancellation scope. Requests already queued stay bound to the
    /// scope they were submitted under.
    pub fn set_cancellation_scope(&self, scope: CancellationToken) {
        self.inner.scope.replace(scope);
    }

    /// State of the bucket for `key` as its worker last published it, if the bucket exists.
    ///
    /// Answers straight away, even while the worker is waiting out a cooldown with work
    /// queued behind it.
    pub fn bucket_snapshot(&self, key: BucketKey) -> Option<BucketSnapshot> {
        let now = self.inner.shared.clock.now_millis();
        let buckets = self.buckets();
        let state = buckets.get(&key)?.state.borrow().snapshot(now);
        Some(state)
    }

    /// Remaining service-wide pause, if one is active.
    pub fn global_gate_remaining(&self) -> Option<Duration> {
        let shared = &self.inner.shared;
        shared.gate.remaining(shared.clock.now_millis())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets().len()
    }
}

fn spawn_worker(shared: Arc<Shared>, key: BucketKey) -> BucketHandle {
    let window = if shared.config.local_windows() { key.group().default_window() } else { None };
    let (published, state) = watch::channel(BucketState::new(window));
    let (queue, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_bucket(shared, key, rx, published));
    BucketHandle { queue, state }
}

async fn run_bucket(
    shared: Arc<Shared>,
    key: BucketKey,
    mut queue: mpsc::UnboundedReceiver<Job>,
    published: watch::Sender<BucketState>,
) {
    let mut state = published.borrow().clone();
    debug!(bucket = %key, "bucket worker started");

    while let Some(job) = queue.recv().await {
        let (result, status) = execute(&shared, key, &mut state, &published, &job).await;
        shared
            .telemetry
            .emit(DispatchEvent::Completed {
                bucket: key,
                status,
                succeeded: result.is_ok(),
                elapsed: job.submitted_at.elapsed(),
            })
            .await;
        let _ = job.reply.send(result);
    }
    debug!(bucket = %key, "bucket worker stopped");
}

fn publish(published: &watch::Sender<BucketState>, state: &BucketState) {
    published.send_if_modified(|current| {
        if current == state {
            return false;
        }
        current.clone_from(state);
        true
    });
}

/// Result of one transport call, before the worker decides what to do with it.
enum Attempt {
    Success { response: Response, status: Option<u16>, info: RateLimitInfo },
    Throttled(RateLimitInfo),
    Failed { error: DispatchError, status: u16, info: RateLimitInfo },
    Fault(DispatchError),
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn wait_or_cancel(delay: Duration, scope: &RequestScope) -> Result<(), DispatchError> {
    tokio::select! {
        biased;
        _ = scope.cancelled() => Err(DispatchError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

async fn execute(
    shared: &Shared,
    key: BucketKey,
    state: &mut BucketState,
    published: &watch::Sender<BucketState>,
    job: &Job,
) -> (Result<Response, DispatchError>, Option<u16>) {
    let mut last_status = None;
    let mut bad_gateway_retries = 0usize;

    loop {
        if job.scope.is_cancelled() || job.reply.is_closed() {
            debug!(bucket = %key, "request cancelled before dispatch");
            return (Err(DispatchError::Cancelled), last_status);
        }

        let now = shared.clock.now_millis();
        if let Some(wait) = shared.gate.remaining(now) {
            debug!(bucket = %key, wait_ms = millis(wait), "waiting on global rate limit");
            if let Err(e) = wait_or_cancel(wait, &job.scope).await {
                return (Err(e), last_status);
            }
            continue;
        }
        let decision = state.check(now);
        publish(published, state);
        if let Decision::Wait { until, reason } = decision {
            let wait = Duration::from_millis(until.saturating_sub(now));
            debug!(bucket = %key, wait_ms = millis(wait), ?reason, "waiting on bucket");
            if let Err(e) = wait_or_cancel(wait, &job.scope).await {
                return (Err(e), last_status);
            }
            continue;
        }

        state.on_dispatch(now);
        publish(published, state);
        let attempt = tokio::select! {
            biased;
            _ = job.scope.cancelled() => {
                debug!(bucket = %key, "in-flight request cancelled");
                return (Err(DispatchError::Cancelled), last_status);
            }
            attempt = try_once(shared, &job.request, job.timeout) => attempt,
        };

        let now = shared.clock.now_millis();
        match attempt {
            Attempt::Success { response, status, info } => {
                state.on_response(&info, now);
                publish(published, state);
                return (Ok(response), status);
            }
            Attempt::Throttled(info) => {
                last_status = Some(429);
                let retry_after = info.throttle_delay();
                let until = now.saturating_add(millis(retry_after));
                if info.global {
                    if shared.gate.activate(until) {
                        warn!(
                            bucket = %key,
                            retry_after_ms = millis(retry_after),
                            "global rate limit hit; pausing all buckets"
                        );
                    }
                } else {
                    state.on_throttled(until);
                    publish(published, state);
                    warn!(bucket = %key, retry_after_ms = millis(retry_after), "bucket rate limited");
                }
                shared
                    .telemetry
                    .emit(DispatchEvent::RateLimited { bucket: key, retry_after, global: info.global })
                    .await;
            }
            Attempt::Failed { error, status, info } => {
                state.on_response(&info, now);
                publish(published, state);
                last_status = Some(status);
                let retry = status == 502
                    && shared.config.retry_bad_gateway()
                    && bad_gateway_retries < shared.config.max_bad_gateway_retries() as usize;
                if !retry {
                    return (Err(error), last_status);
                }
                bad_gateway_retries += 1;
                let delay = shared.config.bad_gateway_backoff().delay(bad_gateway_retries);
                warn!(bucket = %key, attempt = bad_gateway_retries, delay_ms = millis(delay), "bad gateway; retrying");
                if let Err(e) = wait_or_cancel(delay, &job.scope).await {
                    return (Err(e), last_status);
                }
            }
            Attempt::Fault(error) => {
                debug!(bucket = %key, error = %error, "transport fault");
                return (Err(error), last_status);
            }
        }
    }
}

async fn try_once(shared: &Shared, request: &Request, timeout: Duration) -> Attempt {
    match request {
        Request::Frame(frame) => {
            match tokio::time::timeout(timeout, frame.sink.send(frame.payload.clone())).await {
                Ok(Ok(())) => Attempt::Success {
                    response: Response::Sent,
                    status: None,
                    info: RateLimitInfo::default(),
                },
                Ok(Err(e)) => Attempt::Fault(e.into()),
                Err(_) => Attempt::Fault(TransportError::Timeout(timeout).into()),
            }
        }
        Request::Rest(rest) => {
            match tokio::time::timeout(timeout, shared.transport.request(rest)).await {
                Ok(Ok(raw)) => classify(raw, rest.header_only),
                Ok(Err(e)) => Attempt::Fault(e.into()),
                Err(_) => Attempt::Fault(TransportError::Timeout(timeout).into()),
            }
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    code: Option<u64>,
    message: Option<String>,
}

fn classify(raw: RawResponse, header_only: bool) -> Attempt {
    let mut info = RateLimitInfo::from_headers(&raw.headers);
    match raw.status {
        429 => {
            info.merge_throttle_body(&raw.body);
            Attempt::Throttled(info)
        }
        status @ 200..=399 => {
            let response = if header_only {
                Response::Headers { status, rate_limit: info.clone() }
            } else {
                Response::Body(raw.body)
            };
            Attempt::Success { response, status: Some(status), info }
        }
        status @ 400..=499 => {
            let parsed = serde_json::from_slice::<ErrorBody>(&raw.body).ok();
            let code = parsed.as_ref().and_then(|b| b.code);
            let message = parsed
                .and_then(|b| b.message)
                .unwrap_or_else(|| String::from_utf8_lossy(&raw.body).trim().to_owned());
            Attempt::Failed { error: DispatchError::Rejected { status, code, message }, status, info }
        }
        status => Attempt::Failed { error: DispatchError::Server { status }, status, info },
    }
}

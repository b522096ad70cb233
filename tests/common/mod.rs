//! Stub transports shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bucketline::bucket::Verb;
use bucketline::config::SessionConfig;
use bucketline::error::TransportError;
use bucketline::transport::{
    DuplexLink, DuplexTransport, FrameSink, Inbound, RawResponse, RestRequest, RestTransport,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Generous bound for waits in paused-time tests; a hang fails instead of blocking forever.
pub const WAIT: Duration = Duration::from_secs(600);

pub async fn within<F: std::future::Future>(what: &str, fut: F) -> F::Output {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(out) => out,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

pub enum Outcome {
    Respond(RawResponse),
    Fail(TransportError),
    /// Never completes.
    Hang,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub verb: Verb,
    pub route: String,
    pub body: Vec<u8>,
    pub at: Instant,
}

impl Call {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Default)]
struct RestState {
    scripts: HashMap<String, VecDeque<Outcome>>,
    calls: Vec<Call>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    total_in_flight: usize,
    max_total_in_flight: usize,
}

/// REST stub answering from per-route scripts. Unscripted calls get `200 {}`.
#[derive(Default)]
pub struct ScriptedRest {
    state: Mutex<RestState>,
    latency: Duration,
}

struct InFlight<'a> {
    rest: &'a ScriptedRest,
    route: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.rest.state.lock().unwrap();
        if let Some(n) = state.in_flight.get_mut(&self.route) {
            *n -= 1;
        }
        state.total_in_flight -= 1;
    }
}

impl ScriptedRest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self { latency, ..Default::default() })
    }

    pub fn script(&self, route: &str, outcome: Outcome) {
        self.state.lock().unwrap().scripts.entry(route.to_owned()).or_default().push_back(outcome);
    }

    pub fn respond(&self, route: &str, response: RawResponse) {
        self.script(route, Outcome::Respond(response));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, route: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.route == route).collect()
    }

    pub fn max_in_flight(&self, route: &str) -> usize {
        self.state.lock().unwrap().max_in_flight.get(route).copied().unwrap_or(0)
    }

    pub fn max_total_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_total_in_flight
    }

    fn begin(&self, request: &RestRequest) -> (InFlight<'_>, Option<Outcome>) {
        let mut state = self.state.lock().unwrap();
        let route = request.route.clone();
        state.calls.push(Call {
            verb: request.verb,
            route: route.clone(),
            body: request.body.clone().unwrap_or_default(),
            at: Instant::now(),
        });
        let current = {
            let n = state.in_flight.entry(route.clone()).or_default();
            *n += 1;
            *n
        };
        let max = state.max_in_flight.entry(route.clone()).or_default();
        *max = (*max).max(current);
        state.total_in_flight += 1;
        state.max_total_in_flight = state.max_total_in_flight.max(state.total_in_flight);
        let outcome = state.scripts.get_mut(&route).and_then(VecDeque::pop_front);
        (InFlight { rest: self, route }, outcome)
    }
}

#[async_trait]
impl RestTransport for ScriptedRest {
    async fn request(&self, request: &RestRequest) -> Result<RawResponse, TransportError> {
        let (_guard, outcome) = self.begin(request);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match outcome {
            None => Ok(RawResponse::new(200).with_body("{}")),
            Some(Outcome::Respond(response)) => Ok(response),
            Some(Outcome::Fail(err)) => Err(err),
            Some(Outcome::Hang) => std::future::pending().await,
        }
    }
}

pub fn throttled(retry_after_secs: f64, global: bool) -> RawResponse {
    RawResponse::new(429)
        .with_body(json!({ "retry_after": retry_after_secs, "global": global }).to_string())
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

struct FakeSink {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    closes: Arc<Mutex<Vec<u16>>>,
}

#[async_trait]
impl FrameSink for FakeSink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if !self.closes.lock().unwrap().is_empty() {
            return Err(TransportError::Closed);
        }
        self.frames.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&self, code: u16) -> Result<(), TransportError> {
        self.closes.lock().unwrap().push(code);
        Ok(())
    }
}

/// Server side of one accepted connection.
pub struct ServerConn {
    pub url: String,
    to_client: mpsc::Sender<Inbound>,
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    closes: Arc<Mutex<Vec<u16>>>,
}

impl ServerConn {
    pub async fn send(&self, frame: Value) {
        let _ = self.to_client.send(Inbound::Text(frame.to_string())).await;
    }

    pub async fn send_raw(&self, message: Inbound) {
        let _ = self.to_client.send(message).await;
    }

    pub async fn hello(&self, interval_ms: u64) {
        self.send(json!({ "op": 10, "d": { "heartbeat_interval": interval_ms } })).await;
    }

    pub async fn dispatch(&self, event: &str, seq: u64, data: Value) {
        self.send(json!({ "op": 0, "s": seq, "t": event, "d": data })).await;
    }

    pub async fn ready(&self, session_id: &str, seq: u64) {
        self.dispatch("READY", seq, json!({ "session_id": session_id })).await;
    }

    pub async fn ack(&self) {
        self.send(json!({ "op": 11 })).await;
    }

    pub async fn close(&self, code: u16) {
        self.send_raw(Inbound::Closed { code: Some(code), reason: String::new() }).await;
    }

    /// Next frame the client sent, as JSON.
    pub async fn next_frame(&mut self) -> Value {
        let bytes = within("a client frame", self.from_client.recv())
            .await
            .expect("client connection dropped");
        serde_json::from_slice(&bytes).expect("client frames are JSON")
    }

    /// Next frame with opcode `op`, skipping heartbeats.
    pub async fn expect_op(&mut self, op: u64) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["op"] == op {
                return frame;
            }
            assert_eq!(frame["op"], 1, "unexpected frame {}", frame);
        }
    }

    pub fn try_next_frame(&mut self) -> Option<Value> {
        self.from_client.try_recv().ok().map(|b| serde_json::from_slice(&b).unwrap())
    }

    pub fn close_codes(&self) -> Vec<u16> {
        self.closes.lock().unwrap().clone()
    }
}

/// Duplex stub handing each accepted connection to the test.
pub struct FakeGateway {
    accepted_tx: mpsc::UnboundedSender<ServerConn>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerConn>>,
    fail_next: AtomicUsize,
    attempts: Mutex<Vec<Instant>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            fail_next: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
        })
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub async fn accept(&self) -> ServerConn {
        let mut rx = self.accepted_rx.lock().await;
        within("a gateway connection", rx.recv()).await.expect("gateway dropped")
    }
}

#[async_trait]
impl DuplexTransport for FakeGateway {
    async fn connect(&self, url: &str) -> Result<DuplexLink, TransportError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (to_client, inbound) = mpsc::channel(64);
        let (frames, from_client) = mpsc::unbounded_channel();
        let closes = Arc::new(Mutex::new(Vec::new()));
        let _ = self.accepted_tx.send(ServerConn {
            url: url.to_owned(),
            to_client,
            from_client,
            closes: closes.clone(),
        });
        Ok(DuplexLink { sink: Arc::new(FakeSink { frames, closes }), inbound })
    }
}

pub fn session_config() -> SessionConfig {
    SessionConfig::builder("secret-token")
        .gateway_url("wss://gateway.test")
        .reconnect(Duration::from_secs(1), Duration::from_secs(60), Duration::ZERO)
        .build()
        .unwrap()
}

//! The session driver: one task per running session and the only writer of session data.
//!
//! Each loop iteration opens one connection, runs it until it ends, classifies the ending
//! and decides whether and when to try again.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::close::{self, CloseClass};
use super::events::{EventRegistry, GatewayEvent};
use super::heartbeat::{self, Pulse, Signal};
use super::state::{Published, SessionData, SessionState};
use crate::backoff::ReconnectBackoff;
use crate::bucket::BucketKey;
use crate::config::SessionConfig;
use crate::dispatcher::{Dispatcher, FrameRequest, Request, SubmitOptions};
use crate::error::SessionError;
use crate::frame::{self, Frame, Hello, OpCode, Ready};
use crate::sleeper::Sleeper;
use crate::telemetry::{SessionEvent, Telemetry};
use crate::transport::{DuplexTransport, FrameSink, Inbound};

/// Everything the driver shares with the public handle.
pub(crate) struct Shared {
    pub config: ArcSwap<SessionConfig>,
    pub dispatcher: Dispatcher,
    pub transport: Arc<dyn DuplexTransport>,
    pub sleeper: Arc<dyn Sleeper>,
    pub telemetry: Telemetry,
    pub registry: EventRegistry,
    pub state: watch::Sender<SessionState>,
    pub link: ArcSwapOption<Outbound>,
    published: Mutex<Published>,
}

impl Shared {
    pub fn new(
        config: SessionConfig,
        dispatcher: Dispatcher,
        transport: Arc<dyn DuplexTransport>,
        sleeper: Arc<dyn Sleeper>,
        telemetry: Telemetry,
    ) -> Self {
        let registry = EventRegistry::new(config.handler_panic_limit());
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            config: ArcSwap::from_pointee(config),
            dispatcher,
            transport,
            sleeper,
            telemetry,
            registry,
            state,
            link: ArcSwapOption::empty(),
            published: Mutex::new(Published::default()),
        }
    }

    pub fn published(&self) -> MutexGuard<'_, Published> {
        self.published.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn publish(&self, update: impl FnOnce(&mut Published)) {
        update(&mut self.published());
    }

    pub async fn set_state(&self, to: SessionState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(from = ?from, to = ?to, "session state changed");
            self.telemetry.emit(SessionEvent::StateChanged { from, to }).await;
        }
    }
}

/// Sends frames on one live connection, through the gateway buckets of the dispatcher.
#[derive(Clone)]
pub(crate) struct Outbound {
    dispatcher: Dispatcher,
    telemetry: Telemetry,
    sink: Arc<dyn FrameSink>,
    token: CancellationToken,
}

impl Outbound {
    pub async fn send(&self, frame: Frame, key: BucketKey) -> Result<(), SessionError> {
        let payload = frame.encode()?;
        let request = Request::Frame(FrameRequest { op: frame.op, payload, sink: self.sink.clone() });
        let options = SubmitOptions::default().with_scope(self.token.clone());
        self.dispatcher.submit_with(key, request, options).await?;
        self.telemetry.emit(SessionEvent::FrameSent { op: frame.op }).await;
        Ok(())
    }
}

/// How one connection ended.
enum Ended {
    /// The session was cancelled by its owner.
    Cancelled,
    /// Reconnecting cannot help.
    Stopped(SessionError),
    /// Try again after the backoff delay. `established` connections had reset the counter, so
    /// they wait the base delay.
    Lost { established: bool, error: Option<SessionError> },
}

pub(crate) async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut data = SessionData::default();
    let mut backoff = shared.config.load().reconnect_backoff();

    loop {
        let delay = match connect_once(&shared, &mut data, &mut backoff, &cancel).await {
            Ended::Cancelled => return,
            Ended::Stopped(err) => {
                error!(error = %err, "gateway session stopped; not reconnecting");
                data.clear_session();
                shared.publish(|p| {
                    p.clear_session();
                    p.last_error = Some(err);
                });
                shared.set_state(SessionState::Disconnected).await;
                return;
            }
            Ended::Lost { established, error } => {
                if let Some(err) = error {
                    warn!(error = %err, "gateway connection failed");
                    shared.publish(|p| p.last_error = Some(err));
                }
                shared.set_state(SessionState::Disconnected).await;
                if established {
                    debug!("established connection lost");
                }
                backoff.next_delay()
            }
        };

        let failures = backoff.failures();
        info!(delay_ms = delay.as_millis() as u64, failures, "reconnecting after backoff");
        shared.telemetry.emit(SessionEvent::Reconnecting { delay, failures }).await;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = shared.sleeper.sleep(delay) => {}
        }
    }
}

async fn connect_once(
    shared: &Shared,
    data: &mut SessionData,
    backoff: &mut ReconnectBackoff,
    cancel: &CancellationToken,
) -> Ended {
    let config = shared.config.load_full();
    let Some(url) = config.connect_url() else {
        return Ended::Stopped(SessionError::MissingGatewayUrl);
    };

    shared.set_state(SessionState::Connecting).await;
    let timeout = config.connect_timeout();
    let deadline = Instant::now() + timeout;
    debug!(url = %url, "opening gateway connection");
    let opened = tokio::select! {
        _ = cancel.cancelled() => return Ended::Cancelled,
        opened = tokio::time::timeout_at(deadline, shared.transport.connect(&url)) => opened,
    };
    let link = match opened {
        Ok(Ok(link)) => link,
        Ok(Err(err)) => return Ended::Lost { established: false, error: Some(err.into()) },
        Err(_) => {
            return Ended::Lost { established: false, error: Some(SessionError::Timeout(timeout)) }
        }
    };

    let token = cancel.child_token();
    let outbound = Outbound {
        dispatcher: shared.dispatcher.clone(),
        telemetry: shared.telemetry.clone(),
        sink: link.sink.clone(),
        token: token.clone(),
    };
    shared.link.store(Some(Arc::new(outbound.clone())));

    let mut connection = Connection {
        shared,
        config: &config,
        pulse: Arc::new(Pulse::new(data.last_sequence)),
        outbound,
        heartbeat: None,
        established: false,
        close_with: None,
    };
    let ended = connection.run(link.inbound, data, backoff, deadline, timeout).await;

    // stops the heartbeat and abandons frames still queued for this connection
    token.cancel();
    shared.link.store(None);
    if let Some(code) = connection.close_with {
        shared.set_state(SessionState::Disconnecting).await;
        if let Err(err) = link.sink.close(code).await {
            debug!(error = %err, code, "closing the gateway connection failed");
        }
    }
    ended
}

/// One live connection.
struct Connection<'a> {
    shared: &'a Shared,
    config: &'a SessionConfig,
    pulse: Arc<Pulse>,
    outbound: Outbound,
    heartbeat: Option<JoinHandle<()>>,
    /// Reached `Connected`.
    established: bool,
    /// Close code to send when the client ends the connection itself.
    close_with: Option<u16>,
}

impl Connection<'_> {
    async fn run(
        &mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        data: &mut SessionData,
        backoff: &mut ReconnectBackoff,
        deadline: Instant,
        timeout: Duration,
    ) -> Ended {
        let (signal_tx, mut signals) = mpsc::channel(1);
        let token = self.outbound.token.clone();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.close_with = Some(close::NORMAL_CLOSE);
                    return Ended::Cancelled;
                }
                Some(signal) = signals.recv() => return self.on_signal(signal, data),
                _ = tokio::time::sleep_until(deadline), if !self.established => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "gateway handshake timed out");
                    self.close_with = Some(close::RESUMABLE_CLOSE);
                    return self.lost(Some(SessionError::Timeout(timeout)));
                }
                message = inbound.recv() => match message {
                    None => return self.on_close(None, "", data),
                    Some(Inbound::Closed { code, reason }) => return self.on_close(code, &reason, data),
                    Some(message) => {
                        if let Some(ended) = self.on_message(&message, data, backoff, &signal_tx).await {
                            return ended;
                        }
                    }
                },
            }
        }
    }

    fn lost(&self, error: Option<SessionError>) -> Ended {
        Ended::Lost { established: self.established, error }
    }

    /// Drop the connection on our side and resume on the next one.
    fn abandon(&mut self, data: &mut SessionData) -> Ended {
        data.resumable = true;
        self.close_with = Some(close::RESUMABLE_CLOSE);
        self.lost(None)
    }

    fn forget_session(&self, data: &mut SessionData) {
        data.clear_session();
        self.pulse.set_sequence(None);
        self.shared.publish(Published::clear_session);
    }

    fn on_close(&mut self, code: Option<u16>, reason: &str, data: &mut SessionData) -> Ended {
        let reason = if reason.is_empty() { close::describe(code).to_owned() } else { reason.to_owned() };
        match close::classify(code) {
            CloseClass::Fatal => {
                Ended::Stopped(SessionError::Fatal { code: code.unwrap_or_default(), reason })
            }
            CloseClass::Fresh => {
                info!(code = ?code, reason = %reason, "gateway ended the session; starting fresh");
                self.forget_session(data);
                self.lost(None)
            }
            CloseClass::Resumable => {
                info!(code = ?code, reason = %reason, "gateway connection closed; will resume");
                data.resumable = true;
                self.lost(None)
            }
        }
    }

    fn on_signal(&mut self, signal: Signal, data: &mut SessionData) -> Ended {
        match signal {
            Signal::Stale { since_ack } => {
                warn!(since_ack_ms = since_ack.as_millis() as u64, "no heartbeat ack; dropping stale connection");
                self.abandon(data)
            }
            Signal::Failed(err) => {
                data.resumable = true;
                self.close_with = Some(close::RESUMABLE_CLOSE);
                self.lost(Some(err))
            }
        }
    }

    async fn drop_frame(&self, reason: String) {
        warn!(reason = %reason, "dropping gateway frame");
        self.shared.telemetry.emit(SessionEvent::FrameDropped { reason }).await;
    }

    async fn send(&mut self, frame: Frame) -> Option<Ended> {
        let op = frame.op;
        match self.outbound.send(frame, BucketKey::gateway()).await {
            Ok(()) => None,
            Err(_) if self.outbound.token.is_cancelled() => {
                self.close_with = Some(close::NORMAL_CLOSE);
                Some(Ended::Cancelled)
            }
            Err(err) => {
                warn!(op = ?op, error = %err, "gateway frame could not be sent");
                self.close_with = Some(close::RESUMABLE_CLOSE);
                Some(self.lost(Some(err)))
            }
        }
    }

    async fn on_message(
        &mut self,
        message: &Inbound,
        data: &mut SessionData,
        backoff: &mut ReconnectBackoff,
        signals: &mpsc::Sender<Signal>,
    ) -> Option<Ended> {
        let frame = match Frame::decode(message)? {
            Ok(frame) => frame,
            Err(fault) => {
                self.drop_frame(fault.to_string()).await;
                return None;
            }
        };
        trace!(frame = %frame, "frame received");

        match frame.op {
            OpCode::Hello => self.on_hello(&frame, data, signals).await,
            OpCode::Dispatch => self.on_dispatch(frame, data, backoff).await,
            OpCode::Heartbeat => {
                debug!("gateway requested a heartbeat");
                self.pulse.beat_sent();
                self.send(frame::heartbeat(data.last_sequence)).await
            }
            OpCode::HeartbeatAck => {
                if let Some(latency) = self.pulse.acked() {
                    debug!(latency_ms = latency.as_millis() as u64, "heartbeat acknowledged");
                    self.shared.publish(|p| p.latency = Some(latency));
                    self.shared.telemetry.emit(SessionEvent::LatencyUpdated { latency }).await;
                }
                None
            }
            OpCode::Reconnect => {
                info!("gateway requested a reconnect");
                Some(self.abandon(data))
            }
            OpCode::InvalidSession => {
                if frame.data.as_bool().unwrap_or(false) {
                    warn!("session invalidated; will resume on a new connection");
                    Some(self.abandon(data))
                } else {
                    warn!("session invalidated; identifying again");
                    self.forget_session(data);
                    self.identify().await
                }
            }
            op => {
                debug!(op = ?op, "ignoring client-only opcode");
                None
            }
        }
    }

    async fn on_hello(
        &mut self,
        frame: &Frame,
        data: &mut SessionData,
        signals: &mpsc::Sender<Signal>,
    ) -> Option<Ended> {
        if self.heartbeat.is_some() {
            debug!("duplicate hello ignored");
            return None;
        }
        let hello = match frame.payload::<Hello>() {
            Ok(hello) if hello.heartbeat_interval > 0 => hello,
            Ok(_) => {
                self.drop_frame("hello without a heartbeat interval".to_owned()).await;
                return None;
            }
            Err(fault) => {
                self.drop_frame(fault.to_string()).await;
                return None;
            }
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        data.heartbeat_interval = Some(interval);
        let _ = self.pulse.acked();
        self.heartbeat = Some(heartbeat::spawn(
            interval,
            self.config.heartbeat_ack_factor(),
            self.pulse.clone(),
            self.outbound.clone(),
            signals.clone(),
            self.outbound.token.clone(),
        ));
        debug!(interval_ms = hello.heartbeat_interval, "heartbeat started");

        match data.resume_point() {
            Some((session_id, seq)) => {
                self.shared.set_state(SessionState::Resuming).await;
                info!(session_id = %session_id, seq, "resuming session");
                self.send(frame::resume(self.config, &session_id, seq)).await
            }
            None => self.identify().await,
        }
    }

    async fn identify(&mut self) -> Option<Ended> {
        self.shared.set_state(SessionState::Identifying).await;
        info!("identifying");
        self.send(frame::identify(self.config)).await
    }

    async fn on_dispatch(
        &mut self,
        frame: Frame,
        data: &mut SessionData,
        backoff: &mut ReconnectBackoff,
    ) -> Option<Ended> {
        let name = frame.event.as_deref().unwrap_or_default();
        if matches!(name, "READY" | "RESUMED") && self.heartbeat.is_none() {
            self.drop_frame(format!("{} before hello", name)).await;
            return None;
        }

        if let Some(seq) = frame.sequence {
            if data.observe_sequence(seq) {
                self.pulse.set_sequence(Some(seq));
                self.shared.publish(|p| p.last_sequence = Some(seq));
            }
        }

        match name {
            "READY" => match frame.payload::<Ready>() {
                Ok(ready) => {
                    info!(session_id = %ready.session_id, "session ready");
                    data.session_id = Some(ready.session_id.clone());
                    self.shared.publish(|p| p.session_id = Some(ready.session_id));
                    self.connected(backoff).await;
                }
                Err(fault) => {
                    self.drop_frame(fault.to_string()).await;
                    return None;
                }
            },
            "RESUMED" => {
                info!(seq = ?data.last_sequence, "session resumed");
                self.connected(backoff).await;
            }
            _ => {}
        }

        let event = GatewayEvent { name, sequence: frame.sequence, data: &frame.data };
        let delivered = self.shared.registry.dispatch(&event);
        trace!(event = name, handlers = delivered, "event dispatched");
        None
    }

    async fn connected(&mut self, backoff: &mut ReconnectBackoff) {
        self.established = true;
        backoff.reset();
        self.shared.publish(|p| p.last_error = None);
        self.shared.set_state(SessionState::Connected).await;
    }
}

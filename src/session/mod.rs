//! Persistent gateway session.
//!
//! A [`Session`] keeps one duplex connection alive: it answers the server's `Hello` with an
//! identify or a resume, keeps the heartbeat going, tracks the sequence, and reconnects with
//! exponential backoff when the connection drops. Outbound frames go through the
//! [`Dispatcher`] on the gateway buckets, so they share the client's rate limits.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use bucketline::config::SessionConfig;
//! # use bucketline::session::{Session, SessionState};
//! # use bucketline::Dispatcher;
//! # async fn demo(
//! #     dispatcher: Dispatcher,
//! #     duplex: Arc<dyn bucketline::transport::DuplexTransport>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::builder("token").gateway_url("wss://gateway.example").build()?;
//! let session = Session::new(config, dispatcher, duplex);
//! session.on_event("MESSAGE_CREATE", |event| println!("#{:?} {}", event.sequence, event.data));
//! session.connect()?;
//! session.wait_for(SessionState::Connected).await;
//! # Ok(())
//! # }
//! ```

pub mod close;
mod driver;
pub mod events;
mod heartbeat;
mod state;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bucket::{BucketKey, RouteGroup};
use crate::config::SessionConfig;
use crate::dispatcher::Dispatcher;
use crate::error::SessionError;
use crate::frame::{self, Game};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::Telemetry;
use crate::transport::DuplexTransport;

pub use close::CloseClass;
pub use events::{GatewayEvent, SubscriptionId};
pub use state::SessionState;

use driver::Shared;
use state::Published;

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Cloneable handle to one gateway session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    running: Arc<Mutex<Option<Running>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("handlers", &self.shared.registry)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    dispatcher: Dispatcher,
    transport: Arc<dyn DuplexTransport>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl SessionBuilder {
    /// Sleeper used for reconnect backoff.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn build(self) -> Session {
        let shared =
            Shared::new(self.config, self.dispatcher, self.transport, self.sleeper, self.telemetry);
        Session { shared: Arc::new(shared), running: Arc::new(Mutex::new(None)) }
    }
}

impl Session {
    pub fn new(
        config: SessionConfig,
        dispatcher: Dispatcher,
        transport: Arc<dyn DuplexTransport>,
    ) -> Self {
        Self::builder(config, dispatcher, transport).build()
    }

    pub fn builder(
        config: SessionConfig,
        dispatcher: Dispatcher,
        transport: Arc<dyn DuplexTransport>,
    ) -> SessionBuilder {
        SessionBuilder {
            config,
            dispatcher,
            transport,
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::null(),
        }
    }

    /// Gateway URL used by the next connection attempt.
    pub fn set_gateway_url(&self, url: impl Into<String>) {
        let url = url.into();
        self.shared.config.rcu(|config| {
            let mut config = SessionConfig::clone(config);
            config.set_gateway_url(url.clone());
            config
        });
    }

    pub fn gateway_url(&self) -> Option<String> {
        self.shared.config.load().gateway_url().map(str::to_owned)
    }

    /// Start the driver task. Returns immediately; watch [`Session::state`] for progress.
    pub fn connect(&self) -> Result<(), SessionError> {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(SessionError::AlreadyRunning);
        }
        if self.shared.config.load().connect_url().is_none() {
            return Err(SessionError::MissingGatewayUrl);
        }
        self.shared.publish(|p| p.last_error = None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(driver::run(self.shared.clone(), cancel.clone()));
        *running = Some(Running { cancel, task });
        info!("gateway session started");
        Ok(())
    }

    /// Stop the session: cancel the driver, the heartbeat and queued frames, close the
    /// connection and forget the session. Waits for the driver to stop.
    pub async fn disconnect(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(running) = running {
            self.shared.set_state(SessionState::Disconnecting).await;
            running.cancel.cancel();
            if let Err(err) = running.task.await {
                if err.is_panic() {
                    error!("gateway session driver panicked");
                }
            }
        }
        self.shared.publish(Published::clear_session);
        self.shared.set_state(SessionState::Disconnected).await;
        info!("gateway session stopped");
    }

    pub fn is_running(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Call `handler` for every dispatch event named `event`.
    pub fn on_event<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&GatewayEvent<'_>) + Send + Sync + 'static,
    {
        self.shared.registry.subscribe(Some(event), Arc::new(handler))
    }

    /// Call `handler` for every dispatch event.
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&GatewayEvent<'_>) + Send + Sync + 'static,
    {
        self.shared.registry.subscribe(None, Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.registry.unsubscribe(id)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the session reaches `state`.
    pub async fn wait_for(&self, state: SessionState) {
        let mut rx = self.watch_state();
        // the sender lives as long as `self`
        let _ = rx.wait_for(|current| *current == state).await;
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.published().session_id.clone()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.shared.published().last_sequence
    }

    /// Round trip of the most recent acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.shared.published().latency
    }

    /// Why the last connection attempt failed, or why the session stopped.
    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.published().last_error.clone()
    }

    /// Update the presence shown for this session.
    pub async fn update_status(
        &self,
        idle_since: Option<u64>,
        game: Option<&Game>,
    ) -> Result<(), SessionError> {
        let frame = frame::status_update(idle_since, game);
        self.send_command(frame, BucketKey::global(RouteGroup::UpdateStatus)).await
    }

    /// Ask for the member lists of `owners`; they arrive as dispatch events.
    pub async fn request_members(
        &self,
        owners: &[u64],
        query: &str,
        limit: u32,
    ) -> Result<(), SessionError> {
        let frame = frame::request_members(owners, query, limit);
        self.send_command(frame, BucketKey::gateway()).await
    }

    async fn send_command(&self, frame: frame::Frame, key: BucketKey) -> Result<(), SessionError> {
        if self.state() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let link = self.shared.link.load_full().ok_or(SessionError::NotConnected)?;
        link.send(frame, key).await
    }
}

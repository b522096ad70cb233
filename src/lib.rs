#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bucketline
//!
//! Client plumbing for services that pair a rate-limited request API with a persistent
//! real-time gateway.
//!
//! ## Features
//!
//! - **Bucketed dispatch**: per-bucket FIFO queues, parallel buckets, a global pause
//! - **Transparent throttling**: 429 responses are waited out and retried in place
//! - **Gateway sessions** with heartbeats, sequence tracking, and resume on reconnect
//! - **Reconnect backoff** with jitter, reset once a session is established
//! - **Cooperative cancellation** of everything queued or in flight
//! - **Telemetry** through `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bucketline::config::{ClientConfig, DispatcherConfig, SessionConfig};
//! use bucketline::transport::{DuplexTransport, RestTransport};
//! use bucketline::Client;
//!
//! async fn run(
//!     rest: Arc<dyn RestTransport>,
//!     duplex: Arc<dyn DuplexTransport>,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let session = SessionConfig::builder("token").build()?;
//!     let client = Client::new(ClientConfig::new(DispatcherConfig::default(), session), rest, duplex);
//!
//!     client.start().await?;
//!     client.send_message(7, Some(42), "hello").await?;
//!     client.logout().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod bucket;
pub mod client;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod jitter;
pub mod prelude;
pub mod rate_limit;
pub mod scope;
pub mod session;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, ReconnectBackoff};
pub use bucket::{BucketKey, BucketScope, BucketTable, RouteGroup, Verb};
pub use client::Client;
pub use clock::{Clock, MonotonicClock};
pub use dispatcher::{Dispatcher, Request, Response, SubmitOptions};
pub use error::{ClientError, DispatchError, SessionError, TransportError};
pub use jitter::Jitter;
pub use session::{Session, SessionState};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{DuplexTransport, RestRequest, RestTransport};

//! Capabilities supplied by the environment: one request/response call, and a duplex frame
//! connection. Implementations own sockets, TLS and HTTP; this crate only drives them.
//!
//! Cancellation is expressed by dropping the returned futures, so implementations must be
//! cancel-safe at every await point.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bucket::Verb;
use crate::error::TransportError;

/// One outbound request/response call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestRequest {
    pub verb: Verb,
    pub route: String,
    pub body: Option<Vec<u8>>,
    /// The caller only needs the status and rate-limit metadata, not the body.
    pub header_only: bool,
}

impl RestRequest {
    pub fn new(verb: Verb, route: impl Into<String>) -> Self {
        Self { verb, route: route.into(), body: None, header_only: false }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header_only(mut self) -> Self {
        self.header_only = true;
        self
    }
}

/// What the request transport returns for a completed call, whatever its status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16) -> Self {
        Self { status, ..Default::default() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Issues a single request/response call.
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn request(&self, request: &RestRequest) -> Result<RawResponse, TransportError>;
}

/// Write half of a duplex connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection with `code`. Closing twice is not an error.
    async fn close(&self, code: u16) -> Result<(), TransportError>;
}

/// Inbound traffic of a duplex connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed the connection. No further messages follow.
    Closed { code: Option<u16>, reason: String },
}

/// An open duplex connection.
pub struct DuplexLink {
    pub sink: Arc<dyn FrameSink>,
    pub inbound: mpsc::Receiver<Inbound>,
}

impl fmt::Debug for DuplexLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexLink").finish_non_exhaustive()
    }
}

/// Opens duplex connections.
#[async_trait]
pub trait DuplexTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<DuplexLink, TransportError>;
}

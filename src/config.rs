//! Validated configuration for the dispatcher, the gateway session and the client.
//!
//! Every config has a builder that checks its inputs, and deserializes from JSON with
//! defaults for missing fields. Durations are written in milliseconds (`*_ms` fields).
//!
//! ```rust
//! use bucketline::config::SessionConfig;
//! use std::time::Duration;
//!
//! let config = SessionConfig::builder("token")
//!     .gateway_url("wss://gateway.example")
//!     .heartbeat_ack_factor(3)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.connect_timeout(), Duration::from_secs(30));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{Backoff, ReconnectBackoff};
use crate::jitter::Jitter;

/// Errors produced when validating configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    Zero { field: &'static str },
    #[error("reconnect max ({max:?}) must be >= reconnect base ({base:?})")]
    BackoffRange { base: Duration, max: Duration },
    #[error("token must not be empty")]
    EmptyToken,
    #[error("invalid config json: {0}")]
    Json(String),
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

/// Settings of the rate-limited request dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    request_timeout_ms: u64,
    retry_bad_gateway: bool,
    max_bad_gateway_retries: u32,
    local_windows: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
            retry_bad_gateway: false,
            max_bad_gateway_retries: 10,
            local_windows: true,
        }
    }
}

impl DispatcherConfig {
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder { config: Self::default() }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("request_timeout_ms", self.request_timeout_ms)
    }

    /// Default bound on each transport call.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Retry 502 responses with capped exponential backoff instead of surfacing them.
    pub fn retry_bad_gateway(&self) -> bool {
        self.retry_bad_gateway
    }

    pub fn max_bad_gateway_retries(&self) -> u32 {
        self.max_bad_gateway_retries
    }

    /// Enforce each group's client-side window before the server reports any limits.
    pub fn local_windows(&self) -> bool {
        self.local_windows
    }

    /// Backoff between bad-gateway retries: 1s doubling up to 30s.
    pub fn bad_gateway_backoff(&self) -> Backoff {
        Backoff::exponential(Duration::from_secs(1))
            .with_max(Duration::from_secs(30))
            .unwrap_or_else(|_| Backoff::exponential(Duration::from_secs(1)))
    }
}

/// Builder for [`DispatcherConfig`].
#[derive(Debug, Clone)]
pub struct DispatcherConfigBuilder {
    config: DispatcherConfig,
}

impl DispatcherConfigBuilder {
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn retry_bad_gateway(mut self, enabled: bool) -> Self {
        self.config.retry_bad_gateway = enabled;
        self
    }

    pub fn max_bad_gateway_retries(mut self, retries: u32) -> Self {
        self.config.max_bad_gateway_retries = retries;
        self
    }

    pub fn local_windows(mut self, enabled: bool) -> Self {
        self.config.local_windows = enabled;
        self
    }

    pub fn build(self) -> Result<DispatcherConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Client identification sent with the identify frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            browser: env!("CARGO_PKG_NAME").to_owned(),
            device: env!("CARGO_PKG_NAME").to_owned(),
        }
    }
}

/// Settings of the gateway session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    token: String,
    gateway_url: Option<String>,
    api_version: u8,
    compress: bool,
    large_threshold: u16,
    shard: Option<[u16; 2]>,
    properties: ConnectionProperties,
    heartbeat_ack_factor: u32,
    connect_timeout_ms: u64,
    reconnect_base_ms: u64,
    reconnect_max_ms: u64,
    reconnect_jitter_ms: u64,
    handler_panic_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            gateway_url: None,
            api_version: 6,
            compress: false,
            large_threshold: 250,
            shard: None,
            properties: ConnectionProperties::default(),
            heartbeat_ack_factor: 2,
            connect_timeout_ms: 30_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            reconnect_jitter_ms: 250,
            handler_panic_limit: 3,
        }
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("token", &"<redacted>")
            .field("gateway_url", &self.gateway_url)
            .field("api_version", &self.api_version)
            .field("compress", &self.compress)
            .field("shard", &self.shard)
            .field("heartbeat_ack_factor", &self.heartbeat_ack_factor)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    pub fn builder(token: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder { config: Self { token: token.into(), ..Self::default() } }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::EmptyToken);
        }
        non_zero("heartbeat_ack_factor", u64::from(self.heartbeat_ack_factor))?;
        non_zero("connect_timeout_ms", self.connect_timeout_ms)?;
        non_zero("reconnect_base_ms", self.reconnect_base_ms)?;
        non_zero("handler_panic_limit", u64::from(self.handler_panic_limit))?;
        if self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(ConfigError::BackoffRange {
                base: Duration::from_millis(self.reconnect_base_ms),
                max: Duration::from_millis(self.reconnect_max_ms),
            });
        }
        Ok(())
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn gateway_url(&self) -> Option<&str> {
        self.gateway_url.as_deref()
    }

    pub(crate) fn set_gateway_url(&mut self, url: String) {
        self.gateway_url = Some(url);
    }

    pub fn api_version(&self) -> u8 {
        self.api_version
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn large_threshold(&self) -> u16 {
        self.large_threshold
    }

    pub fn shard(&self) -> Option<[u16; 2]> {
        self.shard
    }

    pub fn properties(&self) -> &ConnectionProperties {
        &self.properties
    }

    /// Missed-ack allowance, in heartbeat intervals, before a connection is stale.
    pub fn heartbeat_ack_factor(&self) -> u32 {
        self.heartbeat_ack_factor
    }

    /// Bound on opening the transport and reaching `Connected`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handler_panic_limit(&self) -> u32 {
        self.handler_panic_limit
    }

    /// Reconnect schedule derived from the `reconnect_*` settings.
    pub fn reconnect_backoff(&self) -> ReconnectBackoff {
        let base = Duration::from_millis(self.reconnect_base_ms);
        let backoff = Backoff::exponential(base)
            .with_max(Duration::from_millis(self.reconnect_max_ms))
            .unwrap_or_else(|_| Backoff::exponential(base));
        ReconnectBackoff::new(
            backoff,
            Jitter::symmetric(Duration::from_millis(self.reconnect_jitter_ms)),
        )
    }

    /// Gateway url with the encoding and version query appended.
    pub fn connect_url(&self) -> Option<String> {
        let base = self.gateway_url.as_deref()?;
        let separator = if base.contains('?') { '&' } else { '?' };
        Some(format!("{}{}encoding=json&v={}", base, separator, self.api_version))
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = Some(url.into());
        self
    }

    pub fn api_version(mut self, version: u8) -> Self {
        self.config.api_version = version;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.config.compress = compress;
        self
    }

    pub fn large_threshold(mut self, threshold: u16) -> Self {
        self.config.large_threshold = threshold;
        self
    }

    pub fn shard(mut self, id: u16, total: u16) -> Self {
        self.config.shard = Some([id, total]);
        self
    }

    pub fn properties(mut self, properties: ConnectionProperties) -> Self {
        self.config.properties = properties;
        self
    }

    pub fn heartbeat_ack_factor(mut self, factor: u32) -> Self {
        self.config.heartbeat_ack_factor = factor;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Reconnect delays: `base` doubling per failure up to `max`, shifted by up to `jitter`.
    pub fn reconnect(mut self, base: Duration, max: Duration, jitter: Duration) -> Self {
        let ms = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        self.config.reconnect_base_ms = ms(base);
        self.config.reconnect_max_ms = ms(max);
        self.config.reconnect_jitter_ms = ms(jitter);
        self
    }

    pub fn handler_panic_limit(mut self, limit: u32) -> Self {
        self.config.handler_panic_limit = limit;
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Combined settings for [`Client`](crate::client::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    pub session: SessionConfig,
}

impl ClientConfig {
    pub fn new(dispatcher: DispatcherConfig, session: SessionConfig) -> Self {
        Self { dispatcher, session }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.dispatcher.validate()?;
        config.session.validate()?;
        Ok(config)
    }
}

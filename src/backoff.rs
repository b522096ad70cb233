//! Backoff strategies for reconnects and bad-gateway retries.
//!
//! Attempt semantics: attempt index `0` represents the initial call (no delay), and retries
//! start at `attempt = 1`. Delays saturate at a documented maximum to avoid overflow.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use bucketline::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(0)); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```

use std::fmt;
use std::time::Duration;

use crate::jitter::Jitter;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Capped exponential backoff: `base * 2^(attempt - 1)`, never above `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Create an exponential backoff strategy
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None }
    }

    /// Set a maximum delay. Returns an error if `max` is zero or `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    /// Calculate the delay for a given attempt number (0-based; 0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let base_nanos = self.base.as_nanos().saturating_mul(multiplier);
        let exp_delay = Duration::from_nanos(base_nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        let capped = self.max.map(|m| exp_delay.min(m)).unwrap_or(exp_delay);
        capped.min(MAX_BACKOFF)
    }
}

/// Failure counter driving the session's reconnect delays.
///
/// Each consecutive failure doubles the delay (with jitter) up to the cap; a successful
/// connection resets the counter.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    backoff: Backoff,
    jitter: Jitter,
    failures: usize,
}

impl ReconnectBackoff {
    pub fn new(backoff: Backoff, jitter: Jitter) -> Self {
        Self { backoff, jitter, failures: 0 }
    }

    /// Record a failed attempt and return how long to wait before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.jitter.apply(self.backoff.delay(self.failures));
        match self.backoff.max() {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> usize {
        self.failures
    }
}

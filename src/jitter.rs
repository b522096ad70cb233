//! Jitter strategies to prevent thundering herd
//!
//! When to use which strategy:
//! - `None`: deterministic delays for tests or tightly controlled workflows.
//! - `Full`: uniform in `[0, delay]`. The heartbeat timer subtracts a full jitter of a
//!   small fraction of the interval so many sessions do not beat in lockstep.
//! - `Symmetric`: uniform in `[delay - spread, delay + spread]`, used by the reconnect
//!   backoff so sessions dropped together do not come back together.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via `apply_with_rng`.
//! - Precision: millisecond conversions saturate to `u64::MAX` to avoid panics on very large durations.
//!
//! Example:
//! ```rust
//! use bucketline::Jitter;
//! use std::time::Duration;
//!
//! let jitter = Jitter::symmetric(Duration::from_millis(250));
//! let delay = jitter.apply(Duration::from_secs(1));
//! assert!(delay >= Duration::from_millis(750));
//! assert!(delay <= Duration::from_millis(1250));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use exact delay
    #[default]
    None,
    /// Full jitter: random between 0 and delay
    Full,
    /// Symmetric jitter: delay shifted by a random offset in `[-spread, spread]`
    Symmetric {
        /// Largest offset applied in either direction.
        spread: Duration,
    },
}

impl Jitter {
    /// Create a full jitter strategy
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Create a symmetric jitter strategy. A zero spread behaves like `None`.
    pub fn symmetric(spread: Duration) -> Self {
        if spread.is_zero() {
            Jitter::None
        } else {
            Jitter::Symmetric { spread }
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_internal(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        self.apply_internal(delay, rng)
    }

    fn as_millis_saturated(duration: Duration) -> u64 {
        duration.as_millis().try_into().unwrap_or(u64::MAX) // Saturate extremely large durations
    }

    fn apply_internal<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = Self::as_millis_saturated(delay);
                if millis == 0 {
                    return Duration::from_millis(0);
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Symmetric { spread } => {
                let millis = Self::as_millis_saturated(delay);
                let spread = Self::as_millis_saturated(*spread);
                let offset = rng.random_range(0..=spread.saturating_mul(2));
                // shift into [millis - spread, millis + spread], floored at zero
                let shifted = millis.saturating_add(offset).saturating_sub(spread);
                Duration::from_millis(shifted)
            }
        }
    }
}

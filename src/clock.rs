//! Clock abstractions used by the dispatcher and the global gate.
//!
//! Rate-limit bookkeeping is expressed in milliseconds relative to a clock epoch so bucket
//! state stays a plain value type and can be driven by hand in tests.
//!
//! Waiting always happens on tokio's timer: a worker turns `deadline - now_millis()` into a
//! `tokio::time::sleep`. A clock may pick any epoch, but it must advance in step with tokio
//! time, or a worker will wake, find its deadline still ahead, and sleep again.

use tokio::time::Instant;

/// Millisecond clock read by the dispatcher. Must advance at the rate of tokio time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `tokio::time::Instant`.
///
/// Follows the tokio clock, so paused-time tests (`start_paused = true`) observe the same
/// instants as `tokio::time::sleep`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

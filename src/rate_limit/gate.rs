use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Process-wide pause declared by the service.
///
/// The only rate-limit data written by more than one bucket worker. The expiry lives in a
/// single atomic and only ever moves forward, so concurrent activations settle on the latest
/// deadline without a lock.
#[derive(Debug, Default)]
pub struct GlobalGate {
    until: AtomicU64,
}

impl GlobalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause all buckets until `until` (clock millis). Returns `true` if this call extended
    /// the pause, `false` if an equal or later deadline was already set.
    pub fn activate(&self, until: u64) -> bool {
        let mut current = self.until.load(Ordering::Acquire);
        loop {
            if current >= until {
                return false;
            }
            match self.until.compare_exchange_weak(
                current,
                until,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Remaining pause at `now`, or `None` when the gate is open.
    pub fn remaining(&self, now: u64) -> Option<Duration> {
        let until = self.until.load(Ordering::Acquire);
        (until > now).then(|| Duration::from_millis(until - now))
    }

    pub fn expires_at(&self) -> Option<u64> {
        match self.until.load(Ordering::Acquire) {
            0 => None,
            until => Some(until),
        }
    }
}

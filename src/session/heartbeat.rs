//! Heartbeat timer for one live connection.
//!
//! The task sends beats on its own through the dispatcher and reads the driver's progress
//! from a [`Pulse`] of atomics. It reports back only when it has to stop: the connection
//! went stale or a beat could not be sent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::driver::Outbound;
use crate::bucket::BucketKey;
use crate::clock::{Clock, MonotonicClock};
use crate::error::SessionError;
use crate::frame;
use crate::jitter::Jitter;

const UNSET: u64 = u64::MAX;

/// Why the heartbeat task stopped.
#[derive(Debug)]
pub(crate) enum Signal {
    Stale { since_ack: Duration },
    Failed(SessionError),
}

/// Heartbeat bookkeeping shared between the driver and the heartbeat task.
#[derive(Debug)]
pub(crate) struct Pulse {
    clock: MonotonicClock,
    last_ack: AtomicU64,
    last_beat: AtomicU64,
    sequence: AtomicU64,
}

impl Pulse {
    /// Starts as if acknowledged right now.
    pub fn new(sequence: Option<u64>) -> Self {
        Self {
            clock: MonotonicClock::default(),
            last_ack: AtomicU64::new(0),
            last_beat: AtomicU64::new(UNSET),
            sequence: AtomicU64::new(sequence.unwrap_or(UNSET)),
        }
    }

    pub fn set_sequence(&self, seq: Option<u64>) {
        self.sequence.store(seq.unwrap_or(UNSET), Ordering::Release);
    }

    pub fn sequence(&self) -> Option<u64> {
        match self.sequence.load(Ordering::Acquire) {
            UNSET => None,
            seq => Some(seq),
        }
    }

    pub fn beat_sent(&self) {
        self.last_beat.store(self.clock.now_millis(), Ordering::Release);
    }

    /// Record an ack. Returns the round trip since the last beat, if one is outstanding.
    pub fn acked(&self) -> Option<Duration> {
        let now = self.clock.now_millis();
        self.last_ack.store(now, Ordering::Release);
        match self.last_beat.swap(UNSET, Ordering::AcqRel) {
            UNSET => None,
            sent => Some(Duration::from_millis(now.saturating_sub(sent))),
        }
    }

    pub fn since_ack(&self) -> Duration {
        let last = self.last_ack.load(Ordering::Acquire);
        Duration::from_millis(self.clock.now_millis().saturating_sub(last))
    }
}

/// Delay before the next beat: the interval minus up to 5% jitter.
pub(crate) fn beat_delay(interval: Duration) -> Duration {
    interval.saturating_sub(Jitter::full().apply(interval / 20))
}

pub(crate) fn is_stale(since_ack: Duration, interval: Duration, ack_factor: u32) -> bool {
    since_ack > interval.saturating_mul(ack_factor)
}

pub(crate) fn spawn(
    interval: Duration,
    ack_factor: u32,
    pulse: Arc<Pulse>,
    outbound: Outbound,
    signals: mpsc::Sender<Signal>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let signal = tokio::select! {
            _ = token.cancelled() => return,
            signal = beat(interval, ack_factor, &pulse, &outbound) => signal,
        };
        let _ = signals.send(signal).await;
    })
}

async fn beat(interval: Duration, ack_factor: u32, pulse: &Pulse, outbound: &Outbound) -> Signal {
    loop {
        tokio::time::sleep(beat_delay(interval)).await;

        let since_ack = pulse.since_ack();
        if is_stale(since_ack, interval, ack_factor) {
            return Signal::Stale { since_ack };
        }
        pulse.beat_sent();
        let sequence = pulse.sequence();
        if let Err(error) = outbound.send(frame::heartbeat(sequence), BucketKey::gateway()).await {
            warn!(error = %error, "heartbeat could not be sent");
            return Signal::Failed(error);
        }
        debug!(sequence = ?sequence, "heartbeat sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_delay_stays_within_five_percent() {
        let interval = Duration::from_millis(41_250);
        for _ in 0..200 {
            let delay = beat_delay(interval);
            assert!(delay <= interval);
            assert!(delay >= interval - interval / 20);
        }
    }

    #[test]
    fn staleness_is_strictly_after_the_factor() {
        let interval = Duration::from_secs(1);
        assert!(!is_stale(Duration::from_millis(2000), interval, 2));
        assert!(is_stale(Duration::from_millis(2001), interval, 2));
        assert!(is_stale(Duration::from_millis(1001), interval, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_measures_round_trip() {
        let pulse = Pulse::new(None);
        assert_eq!(pulse.acked(), None);
        assert_eq!(pulse.sequence(), None);

        pulse.beat_sent();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pulse.acked(), Some(Duration::from_millis(40)));
        // the beat is consumed by its ack
        assert_eq!(pulse.acked(), None);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pulse.since_ack(), Duration::from_millis(300));

        pulse.set_sequence(Some(12));
        assert_eq!(pulse.sequence(), Some(12));
        pulse.set_sequence(None);
        assert_eq!(pulse.sequence(), None);
    }
}

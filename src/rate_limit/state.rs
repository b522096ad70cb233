use std::time::Duration;

use super::{Decision, RateLimitInfo, WaitReason};
use crate::bucket::BucketDefinition;

/// Runtime throttling state of one bucket.
///
/// Owned and mutated by that bucket's worker only. `remaining == None` means the budget is
/// unknown and therefore not enforced locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketState {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<u64>,
    rate_limited: bool,
    window: Option<BucketDefinition>,
}

/// Read-only copy of a bucket's state, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time left until the budget refills, relative to when the snapshot was taken.
    pub reset_in: Option<Duration>,
    pub rate_limited: bool,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl BucketState {
    /// Fresh state; with a local window the budget starts full.
    pub fn new(window: Option<BucketDefinition>) -> Self {
        let budget = window.map(|w| w.window_count);
        Self { limit: budget, remaining: budget, reset_at: None, rate_limited: false, window }
    }

    /// Decide whether the head request may dispatch at `now`.
    ///
    /// Clears an expired cooldown and refills an expired window as a side effect.
    pub fn check(&mut self, now: u64) -> Decision {
        if self.rate_limited {
            match self.reset_at {
                Some(until) if until > now => {
                    return Decision::Wait { until, reason: WaitReason::Cooldown };
                }
                _ => self.rate_limited = false,
            }
        }
        if self.reset_at.is_some_and(|until| until <= now) {
            self.reset_at = None;
            self.remaining = self.limit;
        }
        match (self.remaining, self.reset_at) {
            (Some(0), Some(until)) => Decision::Wait { until, reason: WaitReason::Exhausted },
            _ => Decision::Proceed,
        }
    }

    /// Account for one call leaving the bucket at `now`.
    pub fn on_dispatch(&mut self, now: u64) {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        if self.reset_at.is_none() {
            if let Some(window) = self.window {
                self.reset_at = Some(now.saturating_add(millis(window.window)));
            }
        }
    }

    /// Adopt server-declared numbers from a non-throttled response received at `now`.
    pub fn on_response(&mut self, info: &RateLimitInfo, now: u64) {
        if let Some(limit) = info.limit {
            self.limit = Some(limit);
        }
        if let Some(remaining) = info.remaining {
            self.remaining = Some(remaining);
        }
        if let Some(reset_after) = info.reset_after {
            self.reset_at = Some(now.saturating_add(millis(reset_after)));
        }
    }

    /// Enter a server-declared cooldown until `until`.
    pub fn on_throttled(&mut self, until: u64) {
        self.rate_limited = true;
        self.remaining = Some(0);
        self.reset_at = Some(until);
        if self.limit.is_none() {
            // budget is unknown: allow a single call once the cooldown ends
            self.limit = Some(1);
        }
    }

    /// View of the state at `now`. A reset that has passed reads as already applied, so a
    /// copy published before the worker's next check still reports the refilled budget.
    pub fn snapshot(&self, now: u64) -> BucketSnapshot {
        match self.reset_at {
            Some(until) if until > now => BucketSnapshot {
                limit: self.limit,
                remaining: self.remaining,
                reset_in: Some(Duration::from_millis(until - now)),
                rate_limited: self.rate_limited,
            },
            Some(_) => BucketSnapshot {
                limit: self.limit,
                remaining: self.limit,
                reset_in: None,
                rate_limited: false,
            },
            None => BucketSnapshot {
                limit: self.limit,
                remaining: self.remaining,
                reset_in: None,
                rate_limited: self.rate_limited,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(count: u32, ms: u64) -> Option<BucketDefinition> {
        Some(BucketDefinition::new(count, Duration::from_millis(ms)))
    }

    #[test]
    fn unknown_budget_always_proceeds() {
        let mut state = BucketState::new(None);
        for now in 0..10 {
            assert!(state.check(now).is_proceed());
            state.on_dispatch(now);
        }
        assert_eq!(state.snapshot(10).remaining, None);
    }

    #[test]
    fn local_window_suspends_until_reset() {
        let mut state = BucketState::new(window(2, 1_000));
        assert!(state.check(0).is_proceed());
        state.on_dispatch(0);
        assert!(state.check(10).is_proceed());
        state.on_dispatch(10);

        assert_eq!(
            state.check(20),
            Decision::Wait { until: 1_000, reason: WaitReason::Exhausted }
        );
        assert!(state.check(1_000).is_proceed());
        assert_eq!(state.snapshot(1_000).remaining, Some(2));
    }

    #[test]
    fn remaining_never_goes_negative() {
        let mut state = BucketState::new(window(1, 100));
        state.on_dispatch(0);
        state.on_dispatch(0);
        assert_eq!(state.snapshot(0).remaining, Some(0));
    }

    #[test]
    fn cooldown_blocks_then_clears() {
        let mut state = BucketState::new(None);
        state.on_throttled(50);
        assert!(state.snapshot(10).rate_limited);
        assert_eq!(state.check(10), Decision::Wait { until: 50, reason: WaitReason::Cooldown });

        assert!(state.check(50).is_proceed());
        let snap = state.snapshot(50);
        assert!(!snap.rate_limited);
        assert_eq!(snap.remaining, Some(1));
    }

    #[test]
    fn server_metadata_overrides_local_window() {
        let mut state = BucketState::new(window(5, 5_000));
        state.on_dispatch(0);
        let info = RateLimitInfo {
            limit: Some(10),
            remaining: Some(0),
            reset_after: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        state.on_response(&info, 100);
        assert_eq!(state.check(200), Decision::Wait { until: 400, reason: WaitReason::Exhausted });
        assert!(state.check(400).is_proceed());
        assert_eq!(state.snapshot(400).remaining, Some(10));
    }

    #[test]
    fn exhausted_without_reset_does_not_stall() {
        let mut state = BucketState::new(None);
        state.on_response(&RateLimitInfo { remaining: Some(0), ..Default::default() }, 0);
        assert!(state.check(1).is_proceed());
    }

    #[test]
    fn snapshot_reports_relative_reset() {
        let mut state = BucketState::new(window(3, 1_000));
        state.on_dispatch(100);
        let snap = state.snapshot(600);
        assert_eq!(snap.remaining, Some(2));
        assert_eq!(snap.reset_in, Some(Duration::from_millis(500)));
        assert!(!snap.rate_limited);
    }

    #[test]
    fn snapshot_treats_a_passed_reset_as_applied() {
        let mut state = BucketState::new(None);
        state.on_throttled(500);

        let cooling = state.snapshot(100);
        assert!(cooling.rate_limited);
        assert_eq!(cooling.remaining, Some(0));
        assert_eq!(cooling.reset_in, Some(Duration::from_millis(400)));

        // no check has run since the cooldown ended
        let after = state.snapshot(500);
        assert!(!after.rate_limited);
        assert_eq!(after.remaining, Some(1));
        assert_eq!(after.reset_in, None);
    }
}

//! Rate-limit bookkeeping.
//!
//! This module provides the building blocks the dispatcher's bucket workers use:
//! - [`RateLimitInfo`]: server-declared metadata parsed from a response.
//! - [`GlobalGate`]: the process-wide pause the service can impose across all buckets.
//! - [`BucketState`]: per-bucket budget, reset time and cooldown flag.
//! - [`Decision`]: whether a bucket may dispatch now or must wait.
//!
//! All timestamps are milliseconds on the dispatcher's [`Clock`](crate::clock::Clock).

pub mod gate;
pub mod info;
pub mod state;

pub use gate::GlobalGate;
pub use info::RateLimitInfo;
pub use state::{BucketSnapshot, BucketState};

/// Why a bucket has to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Serving a server-declared cooldown after a throttling response.
    Cooldown,
    /// Call budget used up until the window resets.
    Exhausted,
}

/// The decision returned by a bucket check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The bucket may dispatch its head request.
    Proceed,
    /// The bucket must hold its queue until `until` (clock millis).
    Wait { until: u64, reason: WaitReason },
}

impl Decision {
    /// Helper to check if dispatch may proceed.
    pub fn is_proceed(&self) -> bool {
        matches!(self, Decision::Proceed)
    }
}

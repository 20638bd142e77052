//! Monotonic microsecond timestamps.
//!
//! All peer list and handlespace timers are plain `u64` microsecond values
//! so the engines stay independent of any clock and tests can drive time by
//! hand. The daemon feeds them from [`now_micros`].

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds since the first call in this process.
pub fn now_micros() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
}

pub fn millis(ms: u64) -> u64 {
    ms.saturating_mul(1000)
}

/// Time from `now` until `deadline`, zero if it already passed.
pub fn until(deadline: u64, now: u64) -> Duration {
    Duration::from_micros(deadline.saturating_sub(now))
}

//! Common time helpers for microdoser_core.

use std::time::Duration;

pub use microdoser_traits::clock::{SECS_PER_DAY, SECS_PER_MINUTE};

/// Minutes in one scheduling cycle.
pub const MINUTES_PER_DAY: u16 = 1_440;
/// Number of milliseconds in one second.
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Whole minutes from `earlier` to `later` (seconds), saturating at 0.
#[inline]
pub fn whole_minutes_between(earlier: u64, later: u64) -> u64 {
    later.saturating_sub(earlier) / SECS_PER_MINUTE
}

/// Duration in milliseconds, saturating at `u64::MAX`.
#[inline]
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

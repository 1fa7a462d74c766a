use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds in one minute.
pub const SECS_PER_MINUTE: u64 = 60;
/// Seconds in one day.
pub const SECS_PER_DAY: u64 = 86_400;

/// Readings earlier than 2020-01-01T00:00:00Z are treated as "never synced".
/// Boards without an RTC boot at the Unix epoch.
const MIN_PLAUSIBLE_UNIX_SECS: u64 = 1_577_836_800;

/// A synchronized wall-clock reading, already shifted into local time.
///
/// Hour/minute derivations assume a day of exactly 86 400 seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WallTime {
    local_secs: u64,
}

impl WallTime {
    #[inline]
    pub const fn from_local_secs(local_secs: u64) -> Self {
        Self { local_secs }
    }

    /// Build a reading from a day index and a clock time.
    pub const fn from_day_hms(day: u64, hour: u8, minute: u8, second: u8) -> Self {
        Self {
            local_secs: day * SECS_PER_DAY
                + hour as u64 * 3_600
                + minute as u64 * SECS_PER_MINUTE
                + second as u64,
        }
    }

    #[inline]
    pub const fn local_secs(self) -> u64 {
        self.local_secs
    }

    #[inline]
    pub const fn day(self) -> u64 {
        self.local_secs / SECS_PER_DAY
    }

    #[inline]
    pub const fn hour(self) -> u8 {
        ((self.local_secs / 3_600) % 24) as u8
    }

    #[inline]
    pub const fn minute(self) -> u8 {
        ((self.local_secs / SECS_PER_MINUTE) % 60) as u8
    }

    /// Minutes elapsed since local midnight (0..1440).
    #[inline]
    pub const fn minute_of_day(self) -> u16 {
        ((self.local_secs % SECS_PER_DAY) / SECS_PER_MINUTE) as u16
    }

    /// Start of the current minute, in local seconds.
    #[inline]
    pub const fn floor_minute(self) -> u64 {
        self.local_secs - self.local_secs % SECS_PER_MINUTE
    }
}

/// Time source abstraction for scheduling and actuation timing.
///
/// - wall(): local wall-clock time, or `None` until the clock is synchronized
/// - monotonic_ms(): milliseconds on a monotonic timeline (actuation deadlines)
/// - sleep(): wait between ticks (implementations may simulate)
pub trait TimeSource {
    fn wall(&self) -> Option<WallTime>;
    fn monotonic_ms(&self) -> u64;
    fn sleep(&self, d: Duration);
}

impl<T: TimeSource + ?Sized> TimeSource for Box<T> {
    fn wall(&self) -> Option<WallTime> {
        (**self).wall()
    }
    fn monotonic_ms(&self) -> u64 {
        (**self).monotonic_ms()
    }
    fn sleep(&self, d: Duration) {
        (**self).sleep(d)
    }
}

/// Real time source: `SystemTime` for the wall clock, `Instant` for deadlines.
#[derive(Debug, Clone, Copy)]
pub struct SystemTimeSource {
    epoch: Instant,
    utc_offset_secs: i64,
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SystemTimeSource {
    /// `utc_offset_min` shifts UTC into the controller's local time.
    pub fn new(utc_offset_min: i32) -> Self {
        Self {
            epoch: Instant::now(),
            utc_offset_secs: i64::from(utc_offset_min) * 60,
        }
    }
}

impl TimeSource for SystemTimeSource {
    fn wall(&self) -> Option<WallTime> {
        let unix = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        if unix < MIN_PLAUSIBLE_UNIX_SECS {
            return None;
        }
        let local = (unix as i64).checked_add(self.utc_offset_secs)?;
        u64::try_from(local).ok().map(WallTime::from_local_secs)
    }

    #[inline]
    fn monotonic_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}

#[derive(Debug, Default)]
struct ManualState {
    wall: Option<Duration>,
    mono: Duration,
}

/// Deterministic time source whose time is advanced manually.
///
/// Clones share the same timeline, so a test (or the simulator) can keep a
/// handle while the hub owns another. `sleep(d)` advances both clocks by `d`
/// without actually sleeping.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTimeSource {
    /// A source that has not been synchronized yet.
    pub fn unsynced() -> Self {
        Self::default()
    }

    /// A source synchronized at the given reading.
    pub fn at(now: WallTime) -> Self {
        let src = Self::default();
        src.set_wall(Some(now));
        src
    }

    /// Advance wall (if synced) and monotonic time by `d`.
    pub fn advance(&self, d: Duration) {
        if let Ok(mut st) = self.state.lock() {
            st.mono = st.mono.saturating_add(d);
            if let Some(w) = st.wall {
                st.wall = Some(w.saturating_add(d));
            }
        }
    }

    /// Step the wall clock (or lose sync with `None`); monotonic time is untouched.
    pub fn set_wall(&self, now: Option<WallTime>) {
        if let Ok(mut st) = self.state.lock() {
            st.wall = now.map(|w| Duration::from_secs(w.local_secs()));
        }
    }
}

impl TimeSource for ManualTimeSource {
    fn wall(&self) -> Option<WallTime> {
        let st = self.state.lock().ok()?;
        st.wall.map(|w| WallTime::from_local_secs(w.as_secs()))
    }

    fn monotonic_ms(&self) -> u64 {
        self.state
            .lock()
            .map(|st| st.mono.as_millis() as u64)
            .unwrap_or(0)
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_time_fields() {
        let t = WallTime::from_day_hms(3, 14, 25, 59);
        assert_eq!(t.day(), 3);
        assert_eq!(t.hour(), 14);
        assert_eq!(t.minute(), 25);
        assert_eq!(t.minute_of_day(), 14 * 60 + 25);
        assert_eq!(t.floor_minute(), t.local_secs() - 59);
    }

    #[test]
    fn manual_source_advances_both_timelines() {
        let src = ManualTimeSource::at(WallTime::from_day_hms(0, 23, 59, 30));
        let handle = src.clone();
        handle.sleep(Duration::from_secs(45));
        assert_eq!(src.monotonic_ms(), 45_000);
        let now = src.wall().unwrap();
        assert_eq!((now.day(), now.hour(), now.minute()), (1, 0, 0));
    }

    #[test]
    fn unsynced_source_still_counts_monotonic_time() {
        let src = ManualTimeSource::unsynced();
        src.advance(Duration::from_millis(1_500));
        assert!(src.wall().is_none());
        assert_eq!(src.monotonic_ms(), 1_500);
    }
}

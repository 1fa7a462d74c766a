//! Dose schedules: time-of-day slots, explicit schedules and synthesis.
//!
//! A schedule is resolved once at construction (`ScheduleMode::resolve`) so
//! the pump controller only ever sees a concrete, sorted `DoseSchedule`.

use core::fmt;

use microdoser_traits::WallTime;

use crate::error::{BuildError, Result};
use crate::util::{MINUTES_PER_DAY, SECS_PER_DAY, SECS_PER_MINUTE};

/// Default cap on slots per pump: one dose every five minutes.
pub const DEFAULT_MAX_SLOTS: usize = 288;

/// Relative slack applied before flooring `daily / min_dose`, so that values
/// such as `0.3 / 0.1` entered as `f32` still count three slots.
const SLOT_RATIO_SLACK: f64 = 1e-6;

/// A minute within the 24h cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(eyre::Report::new(BuildError::InvalidTimeOfDay { hour, minute }));
        }
        Ok(Self { hour, minute })
    }

    /// Wraps modulo one day.
    #[inline]
    pub const fn from_minute_of_day(total: u16) -> Self {
        let m = total % MINUTES_PER_DAY;
        Self {
            hour: (m / 60) as u8,
            minute: (m % 60) as u8,
        }
    }

    #[inline]
    pub const fn of(now: WallTime) -> Self {
        Self {
            hour: now.hour(),
            minute: now.minute(),
        }
    }

    #[inline]
    pub const fn hour(self) -> u8 {
        self.hour
    }

    #[inline]
    pub const fn minute(self) -> u8 {
        self.minute
    }

    #[inline]
    pub const fn minute_of_day(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }

    #[inline]
    const fn secs_of_day(self) -> u64 {
        self.minute_of_day() as u64 * SECS_PER_MINUTE
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// A concrete dated instance of a schedule slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Occurrence {
    /// Local wall-clock seconds at which the slot begins.
    pub at: u64,
    pub slot: TimeOfDay,
}

/// Sorted, duplicate-free list of daily dose times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoseSchedule {
    entries: Vec<TimeOfDay>,
}

impl DoseSchedule {
    /// Sorts and collapses duplicates.
    pub fn from_entries(entries: impl IntoIterator<Item = TimeOfDay>) -> Self {
        let mut entries: Vec<TimeOfDay> = entries.into_iter().collect();
        entries.sort_unstable();
        entries.dedup();
        Self { entries }
    }

    pub fn entries(&self) -> &[TimeOfDay] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, slot: TimeOfDay) -> bool {
        self.entries.binary_search(&slot).is_ok()
    }

    /// Most recent occurrence at or before `now` (local seconds).
    pub fn latest_at_or_before(&self, now: u64) -> Option<Occurrence> {
        let day_start = now - now % SECS_PER_DAY;
        let tod = now % SECS_PER_DAY;
        if let Some(slot) = self.entries.iter().rev().find(|s| s.secs_of_day() <= tod) {
            return Some(Occurrence {
                at: day_start + slot.secs_of_day(),
                slot: *slot,
            });
        }
        let last = self.entries.last()?;
        let prev_day = day_start.checked_sub(SECS_PER_DAY)?;
        Some(Occurrence {
            at: prev_day + last.secs_of_day(),
            slot: *last,
        })
    }

    /// First occurrence at or after `from` (local seconds).
    pub fn next_at_or_after(&self, from: u64) -> Option<Occurrence> {
        let day_start = from - from % SECS_PER_DAY;
        let tod = from % SECS_PER_DAY;
        if let Some(slot) = self.entries.iter().find(|s| s.secs_of_day() >= tod) {
            return Some(Occurrence {
                at: day_start + slot.secs_of_day(),
                slot: *slot,
            });
        }
        let first = self.entries.first()?;
        Some(Occurrence {
            at: day_start + SECS_PER_DAY + first.secs_of_day(),
            slot: *first,
        })
    }
}

/// How a pump's schedule is produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleMode {
    /// Operator-supplied dose times.
    Explicit(Vec<TimeOfDay>),
    /// Evenly spaced slots derived from the daily target.
    Auto { min_dose_ml: f32 },
}

impl ScheduleMode {
    pub fn is_auto(&self) -> bool {
        matches!(self, ScheduleMode::Auto { .. })
    }

    /// Turn the mode into a concrete schedule.
    ///
    /// `auto_index` is the pump's position among auto-scheduled pumps and
    /// only affects `Auto`.
    pub fn resolve(
        &self,
        daily_target_ml: f32,
        auto_index: u32,
        stagger_offset_min: u32,
        max_slots: usize,
    ) -> Result<DoseSchedule> {
        match self {
            ScheduleMode::Explicit(entries) => {
                let schedule = DoseSchedule::from_entries(entries.iter().copied());
                if schedule.is_empty() {
                    return Err(eyre::Report::new(BuildError::EmptySchedule));
                }
                if schedule.len() > max_slots {
                    return Err(eyre::Report::new(BuildError::TooManySlots {
                        slots: schedule.len(),
                        max: max_slots,
                    }));
                }
                Ok(schedule)
            }
            ScheduleMode::Auto { min_dose_ml } => synthesize_capped(
                daily_target_ml,
                *min_dose_ml,
                auto_index,
                stagger_offset_min,
                max_slots,
            ),
        }
    }
}

/// Number of slots for a daily target: `max(1, floor(daily / min_dose))`.
pub fn slot_count(daily_target_ml: f32, min_dose_ml: f32) -> Result<usize> {
    if !(daily_target_ml.is_finite() && daily_target_ml > 0.0) {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "daily target must be > 0",
        )));
    }
    if !(min_dose_ml.is_finite() && min_dose_ml > 0.0) {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "minimum dose must be > 0",
        )));
    }
    let ratio = f64::from(daily_target_ml) / f64::from(min_dose_ml);
    let slots = (ratio * (1.0 + SLOT_RATIO_SLACK)).floor();
    // Saturating float→int cast; oversized values are caught by the cap.
    Ok((slots as usize).max(1))
}

/// Synthesize an evenly spaced, staggered schedule with the default cap.
pub fn synthesize(
    daily_target_ml: f32,
    min_dose_ml: f32,
    pump_index: u32,
    stagger_offset_min: u32,
) -> Result<DoseSchedule> {
    synthesize_capped(
        daily_target_ml,
        min_dose_ml,
        pump_index,
        stagger_offset_min,
        DEFAULT_MAX_SLOTS,
    )
}

/// Synthesize with an explicit slot cap.
///
/// Slot `i` lands at `i * floor(1440 / n) + pump_index * stagger` minutes
/// (mod 1440). Exceeding `max_slots` is a configuration error.
pub fn synthesize_capped(
    daily_target_ml: f32,
    min_dose_ml: f32,
    pump_index: u32,
    stagger_offset_min: u32,
    max_slots: usize,
) -> Result<DoseSchedule> {
    let slots = slot_count(daily_target_ml, min_dose_ml)?;
    let cap = max_slots.min(usize::from(MINUTES_PER_DAY));
    if slots > cap {
        return Err(eyre::Report::new(BuildError::TooManySlots { slots, max: cap }));
    }
    let day = u64::from(MINUTES_PER_DAY);
    let interval = day / slots as u64;
    let offset = (u64::from(pump_index) * u64::from(stagger_offset_min)) % day;
    let entries = (0..slots as u64)
        .map(|i| TimeOfDay::from_minute_of_day(((i * interval + offset) % day) as u16));
    Ok(DoseSchedule::from_entries(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tod(h: u8, m: u8) -> TimeOfDay {
        TimeOfDay::new(h, m).unwrap()
    }

    #[test]
    fn time_of_day_rejects_out_of_range() {
        let err = TimeOfDay::new(24, 0).unwrap_err();
        assert_eq!(
            err.downcast_ref::<BuildError>(),
            Some(&BuildError::InvalidTimeOfDay { hour: 24, minute: 0 })
        );
        assert!(TimeOfDay::new(23, 60).is_err());
    }

    #[test]
    fn time_of_day_orders_lexicographically() {
        assert!(tod(7, 59) < tod(8, 0));
        assert!(tod(8, 0) < tod(8, 1));
        assert_eq!(tod(9, 5).to_string(), "09:05");
        assert_eq!(TimeOfDay::from_minute_of_day(1_445), tod(0, 5));
    }

    #[test]
    fn explicit_entries_are_sorted_and_deduplicated() {
        let s = DoseSchedule::from_entries([tod(18, 0), tod(6, 30), tod(18, 0)]);
        assert_eq!(s.entries(), &[tod(6, 30), tod(18, 0)]);
    }

    #[test]
    fn latest_occurrence_wraps_to_previous_day() {
        let s = DoseSchedule::from_entries([tod(8, 0), tod(20, 0)]);
        let now = WallTime::from_day_hms(5, 7, 0, 0).local_secs();
        let occ = s.latest_at_or_before(now).unwrap();
        assert_eq!(occ.slot, tod(20, 0));
        assert_eq!(occ.at, WallTime::from_day_hms(4, 20, 0, 0).local_secs());
    }

    #[test]
    fn latest_occurrence_includes_current_minute() {
        let s = DoseSchedule::from_entries([tod(8, 0)]);
        let now = WallTime::from_day_hms(2, 8, 0, 59).local_secs();
        let occ = s.latest_at_or_before(now).unwrap();
        assert_eq!(occ.at, WallTime::from_day_hms(2, 8, 0, 0).local_secs());
    }

    #[test]
    fn next_occurrence_wraps_to_next_day() {
        let s = DoseSchedule::from_entries([tod(8, 0), tod(20, 0)]);
        let from = WallTime::from_day_hms(1, 20, 0, 1).local_secs();
        let occ = s.next_at_or_after(from).unwrap();
        assert_eq!(occ.at, WallTime::from_day_hms(2, 8, 0, 0).local_secs());
        let exact = WallTime::from_day_hms(1, 20, 0, 0).local_secs();
        assert_eq!(s.next_at_or_after(exact).unwrap().at, exact);
    }

    #[test]
    fn empty_schedule_has_no_occurrences() {
        let s = DoseSchedule::default();
        assert!(s.latest_at_or_before(1_000_000).is_none());
        assert!(s.next_at_or_after(0).is_none());
    }

    #[test]
    fn float_ratio_slack_counts_full_slots() {
        assert_eq!(slot_count(0.3, 0.1).unwrap(), 3);
        assert_eq!(slot_count(100.0, 10.0).unwrap(), 10);
        assert_eq!(slot_count(99.9, 10.0).unwrap(), 9);
    }

    #[test]
    fn zero_min_dose_is_a_config_error() {
        let err = synthesize(100.0, 0.0, 0, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::InvalidConfig(_))
        ));
    }

    #[test]
    fn exceeding_cap_is_a_config_error() {
        let err = synthesize(1_000.0, 1.0, 0, 0).unwrap_err();
        assert_eq!(
            err.downcast_ref::<BuildError>(),
            Some(&BuildError::TooManySlots {
                slots: 1_000,
                max: DEFAULT_MAX_SLOTS
            })
        );
    }

    #[test]
    fn explicit_mode_rejects_empty_list() {
        let err = ScheduleMode::Explicit(vec![])
            .resolve(50.0, 0, 0, DEFAULT_MAX_SLOTS)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<BuildError>(),
            Some(&BuildError::EmptySchedule)
        );
    }
}

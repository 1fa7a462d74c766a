//! Per-pump missed-dose supervision.
//!
//! The monitor tracks which scheduled occurrences a pump has attended (started
//! a dose for) and escalates once the earliest unattended one is more than
//! `grace_minutes` late. Occurrences before the arm point are ignored, which
//! keeps boot, re-enable and fault reset from flagging history.

use core::fmt;
use core::str::FromStr;

use microdoser_traits::WallTime;

use crate::schedule::{DoseSchedule, Occurrence, TimeOfDay};
use crate::util::{SECS_PER_MINUTE, whole_minutes_between};

/// Operator-selected enforcement level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchdogMode {
    #[default]
    Strict,
    Recover,
    Off,
}

impl WatchdogMode {
    pub const fn grace_minutes(self) -> u32 {
        match self {
            WatchdogMode::Strict => 0,
            WatchdogMode::Recover => 10,
            WatchdogMode::Off => 1_440,
        }
    }

    /// Parse an operator string; anything unrecognized falls back to strict.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_else(|()| {
            tracing::warn!(mode = s, "unrecognized watchdog mode; using strict");
            WatchdogMode::Strict
        })
    }
}

impl FromStr for WatchdogMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(WatchdogMode::Strict),
            "recover" => Ok(WatchdogMode::Recover),
            "off" => Ok(WatchdogMode::Off),
            _ => Err(()),
        }
    }
}

impl fmt::Display for WatchdogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WatchdogMode::Strict => "strict",
            WatchdogMode::Recover => "recover",
            WatchdogMode::Off => "off",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogRecord {
    /// Completion time of the most recent dose; never moves backwards.
    pub last_dose_at: Option<u64>,
    pub grace_minutes: u32,
}

/// An occurrence that escalated past grace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overdue {
    pub slot: TimeOfDay,
    pub at: u64,
    pub minutes_late: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arm {
    /// Include the current minute.
    Inclusive,
    /// Start from the next minute.
    Exclusive,
}

#[derive(Debug, Clone)]
pub struct WatchdogMonitor {
    record: WatchdogRecord,
    armed_at: Option<u64>,
    attended_through: Option<u64>,
    rearm: Option<Arm>,
}

impl WatchdogMonitor {
    pub fn new(grace_minutes: u32) -> Self {
        Self {
            record: WatchdogRecord {
                last_dose_at: None,
                grace_minutes,
            },
            armed_at: None,
            attended_through: None,
            rearm: Some(Arm::Inclusive),
        }
    }

    pub fn record(&self) -> WatchdogRecord {
        self.record
    }

    pub fn grace_minutes(&self) -> u32 {
        self.record.grace_minutes
    }

    pub fn set_grace_minutes(&mut self, grace_minutes: u32) {
        self.record.grace_minutes = grace_minutes;
    }

    /// First second from which occurrences count, once synchronized.
    pub fn armed_at(&self) -> Option<u64> {
        self.armed_at
    }

    /// Re-arm from the next minute on the next synchronized tick.
    pub(crate) fn request_rearm(&mut self) {
        self.rearm = Some(Arm::Exclusive);
    }

    pub(crate) fn ensure_armed(&mut self, now: WallTime) {
        if let Some(mode) = self.rearm.take() {
            let base = now.floor_minute();
            self.armed_at = Some(match mode {
                Arm::Inclusive => base,
                Arm::Exclusive => base + SECS_PER_MINUTE,
            });
        }
    }

    /// True if `occ` is after the arm point and not yet attended.
    pub fn is_expected(&self, occ: &Occurrence) -> bool {
        let Some(armed) = self.armed_at else {
            return false;
        };
        occ.at >= armed && self.attended_through.is_none_or(|t| occ.at > t)
    }

    pub(crate) fn mark_attended(&mut self, occ: &Occurrence) {
        self.attended_through = Some(self.attended_through.map_or(occ.at, |t| t.max(occ.at)));
    }

    pub(crate) fn record_completion(&mut self, at: u64) {
        let last = self.record.last_dose_at.map_or(at, |t| t.max(at));
        self.record.last_dose_at = Some(last);
    }

    /// Earliest expected occurrence if it is more than grace minutes late.
    pub fn check(&self, schedule: &DoseSchedule, now: WallTime) -> Option<Overdue> {
        let armed = self.armed_at?;
        let from = self
            .attended_through
            .map_or(armed, |t| armed.max(t.saturating_add(1)));
        let occ = schedule.next_at_or_after(from)?;
        let now = now.local_secs();
        if occ.at > now {
            return None;
        }
        let minutes_late = whole_minutes_between(occ.at, now);
        (minutes_late > u64::from(self.record.grace_minutes)).then_some(Overdue {
            slot: occ.slot,
            at: occ.at,
            minutes_late,
        })
    }
}

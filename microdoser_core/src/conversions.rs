//! `From` implementations bridging `microdoser_config` types to core types.

use crate::config::{CalibrationCfg, SchedulerCfg};
use crate::error::Report;
use crate::schedule::{ScheduleMode, TimeOfDay};
use crate::watchdog::WatchdogMode;

// ── SchedulerCfg ─────────────────────────────────────────────────────────────

impl From<&microdoser_config::HubCfg> for SchedulerCfg {
    fn from(c: &microdoser_config::HubCfg) -> Self {
        Self {
            stagger_offset_min: c.stagger_offset_min,
            max_slots: c.max_slots,
            exclusive_actuation: c.exclusive_actuation,
        }
    }
}

// ── WatchdogMode ─────────────────────────────────────────────────────────────

impl From<&microdoser_config::HubCfg> for WatchdogMode {
    fn from(c: &microdoser_config::HubCfg) -> Self {
        WatchdogMode::parse_lenient(&c.watchdog_mode)
    }
}

// ── CalibrationCfg ───────────────────────────────────────────────────────────

impl From<&microdoser_config::CalibrationCfg> for CalibrationCfg {
    fn from(c: &microdoser_config::CalibrationCfg) -> Self {
        Self {
            prime_ms: c.prime_ms,
            test_ms: c.test_ms,
            min_measured_ml: c.min_measured_ml,
            max_ml_per_sec: c.max_ml_per_sec,
        }
    }
}

// ── ScheduleMode ─────────────────────────────────────────────────────────────

impl TryFrom<&microdoser_config::PumpCfg> for ScheduleMode {
    type Error = Report;

    fn try_from(p: &microdoser_config::PumpCfg) -> Result<Self, Self::Error> {
        match (&p.schedule, p.min_dose_ml) {
            (Some(entries), _) => entries
                .iter()
                .map(|e| TimeOfDay::new(e.hour, e.minute))
                .collect::<Result<Vec<_>, _>>()
                .map(ScheduleMode::Explicit),
            (None, Some(min_dose_ml)) => Ok(ScheduleMode::Auto { min_dose_ml }),
            (None, None) => Err(eyre::eyre!(
                "pump '{}' has neither an explicit schedule nor min_dose_ml",
                p.id
            )),
        }
    }
}

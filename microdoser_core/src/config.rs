//! Runtime configuration structs for the hub.
//!
//! These are separate from the TOML-deserialized config in `microdoser_config`.

use crate::schedule::DEFAULT_MAX_SLOTS;

/// Schedule synthesis and dispatch settings shared by all pumps.
#[derive(Debug, Clone)]
pub struct SchedulerCfg {
    /// Minutes added per auto-scheduled pump index.
    pub stagger_offset_min: u32,
    /// Upper bound on slots per pump. Must be in `1..=1440`.
    pub max_slots: usize,
    /// At most one pump actuates at a time; others queue.
    pub exclusive_actuation: bool,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            stagger_offset_min: 0,
            max_slots: DEFAULT_MAX_SLOTS,
            exclusive_actuation: false,
        }
    }
}

/// Calibration workflow timings and acceptance bounds.
#[derive(Debug, Clone)]
pub struct CalibrationCfg {
    /// Priming run before the measured test run (0 skips priming).
    pub prime_ms: u64,
    /// Fixed test run whose output the operator measures.
    pub test_ms: u64,
    /// Results below this are refused as implausible.
    pub min_measured_ml: f32,
    /// Upper bound on an accepted flow rate.
    pub max_ml_per_sec: f32,
}

impl Default for CalibrationCfg {
    fn default() -> Self {
        Self {
            prime_ms: 10_000,
            test_ms: 10_000,
            min_measured_ml: 0.1,
            max_ml_per_sec: 50.0,
        }
    }
}

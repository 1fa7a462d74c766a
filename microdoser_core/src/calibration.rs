//! Flow-rate model: converts between dose volume and actuation time.

use std::time::Duration;

use crate::config::CalibrationCfg;
use crate::error::{BuildError, RejectReason, Result};

/// Default factor for an uncalibrated pump.
pub const DEFAULT_ML_PER_SEC: f32 = 1.0;

/// Per-pump calibration profile.
///
/// `ml_per_sec` is always finite and > 0. Only an accepted calibration run
/// replaces it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProfile {
    ml_per_sec: f32,
    calibrated_at: Option<u64>,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            ml_per_sec: DEFAULT_ML_PER_SEC,
            calibrated_at: None,
        }
    }
}

impl CalibrationProfile {
    pub fn new(ml_per_sec: f32) -> Result<Self> {
        if !(ml_per_sec.is_finite() && ml_per_sec > 0.0) {
            return Err(eyre::Report::new(BuildError::InvalidCalibration(ml_per_sec)));
        }
        Ok(Self {
            ml_per_sec,
            calibrated_at: None,
        })
    }

    /// Attach the local wall-clock seconds of the last accepted calibration.
    pub fn with_calibrated_at(mut self, at: Option<u64>) -> Self {
        self.calibrated_at = at;
        self
    }

    #[inline]
    pub fn ml_per_sec(&self) -> f32 {
        self.ml_per_sec
    }

    #[inline]
    pub fn calibrated_at(&self) -> Option<u64> {
        self.calibrated_at
    }

    /// Actuation time needed to dispense `volume_ml`.
    ///
    /// Non-positive or non-finite volumes yield `Duration::ZERO`.
    pub fn duration_for(&self, volume_ml: f32) -> Duration {
        if !(volume_ml.is_finite() && volume_ml > 0.0) {
            return Duration::ZERO;
        }
        let secs = f64::from(volume_ml) / f64::from(self.ml_per_sec);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Volume dispensed by running for `d`.
    pub fn volume_for(&self, d: Duration) -> f32 {
        (d.as_secs_f64() * f64::from(self.ml_per_sec)) as f32
    }

    /// Derive a flow rate from a measured test-run volume.
    ///
    /// The profile itself is not touched; callers apply the result on success.
    pub fn rate_from_measurement(
        measured_ml: f32,
        test: Duration,
        cfg: &CalibrationCfg,
    ) -> std::result::Result<f32, RejectReason> {
        if !(measured_ml.is_finite() && measured_ml > 0.0) {
            return Err(RejectReason::NonPositive);
        }
        if measured_ml < cfg.min_measured_ml {
            return Err(RejectReason::BelowMinimum(cfg.min_measured_ml));
        }
        if test.is_zero() {
            return Err(RejectReason::ZeroTestDuration);
        }
        let rate = (f64::from(measured_ml) / test.as_secs_f64()) as f32;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(RejectReason::NonPositive);
        }
        if rate > cfg.max_ml_per_sec {
            return Err(RejectReason::AboveMaxFlow(rate));
        }
        Ok(rate)
    }

    /// Replace the factor with a validated rate. Returns the previous factor.
    pub(crate) fn apply(&mut self, ml_per_sec: f32, at: Option<u64>) -> f32 {
        debug_assert!(ml_per_sec.is_finite() && ml_per_sec > 0.0);
        let previous = self.ml_per_sec;
        self.ml_per_sec = ml_per_sec;
        if at.is_some() {
            self.calibrated_at = at;
        }
        previous
    }
}

//! Type-state builder for `DosingHub`.
//!
//! `build()` is only available once a time source is set; `try_build()` is
//! always available and reports missing pieces at runtime.

use std::collections::HashSet;
use std::marker::PhantomData;

use eyre::WrapErr;
use microdoser_traits::{EnableInput, Output, TimeSource};

use crate::calibration::CalibrationProfile;
use crate::config::{CalibrationCfg, SchedulerCfg};
use crate::error::{BuildError, Result};
use crate::hub::DosingHub;
use crate::pump::PumpController;
use crate::schedule::ScheduleMode;
use crate::util::MINUTES_PER_DAY;
use crate::watchdog::WatchdogMode;

// ── Pump description ─────────────────────────────────────────────────────────

/// Everything needed to construct one pump.
pub struct PumpSpec {
    id: String,
    daily_target_ml: f32,
    mode: ScheduleMode,
    ml_per_sec: f32,
    calibrated_at: Option<u64>,
    dose_ml: Option<f32>,
    grace_minutes: Option<u32>,
    output: Box<dyn Output + Send>,
    enable_input: Option<Box<dyn EnableInput + Send>>,
}

impl PumpSpec {
    pub fn new(
        id: impl Into<String>,
        daily_target_ml: f32,
        mode: ScheduleMode,
        ml_per_sec: f32,
        output: impl Output + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            daily_target_ml,
            mode,
            ml_per_sec,
            calibrated_at: None,
            dose_ml: None,
            grace_minutes: None,
            output: Box::new(output),
            enable_input: None,
        }
    }

    /// Fixed per-slot volume for an explicit schedule instead of `daily / slots`.
    pub fn with_dose_ml(mut self, dose_ml: f32) -> Self {
        self.dose_ml = Some(dose_ml);
        self
    }

    /// Per-pump grace; overrides the hub watchdog mode.
    pub fn with_grace_minutes(mut self, grace_minutes: u32) -> Self {
        self.grace_minutes = Some(grace_minutes);
        self
    }

    pub fn with_enable_input(mut self, input: impl EnableInput + Send + 'static) -> Self {
        self.enable_input = Some(Box::new(input));
        self
    }

    pub fn with_calibrated_at(mut self, at: Option<u64>) -> Self {
        self.calibrated_at = at;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

/// Builder for `DosingHub`. All values are validated on build.
pub struct HubBuilder<T> {
    time: Option<Box<dyn TimeSource + Send>>,
    watchdog_mode: WatchdogMode,
    scheduler: SchedulerCfg,
    calibration: CalibrationCfg,
    pumps: Vec<PumpSpec>,
    _t: PhantomData<T>,
}

impl Default for HubBuilder<Missing> {
    fn default() -> Self {
        Self {
            time: None,
            watchdog_mode: WatchdogMode::default(),
            scheduler: SchedulerCfg::default(),
            calibration: CalibrationCfg::default(),
            pumps: Vec::new(),
            _t: PhantomData,
        }
    }
}

impl HubBuilder<Missing> {
    pub fn with_time_source(self, time: impl TimeSource + Send + 'static) -> HubBuilder<Set> {
        HubBuilder {
            time: Some(Box::new(time)),
            watchdog_mode: self.watchdog_mode,
            scheduler: self.scheduler,
            calibration: self.calibration,
            pumps: self.pumps,
            _t: PhantomData,
        }
    }
}

impl<T> HubBuilder<T> {
    pub fn with_watchdog_mode(mut self, mode: WatchdogMode) -> Self {
        self.watchdog_mode = mode;
        self
    }

    pub fn with_scheduler(mut self, cfg: SchedulerCfg) -> Self {
        self.scheduler = cfg;
        self
    }

    pub fn with_calibration(mut self, cfg: CalibrationCfg) -> Self {
        self.calibration = cfg;
        self
    }

    /// Register a pump; registration order is tick order.
    pub fn add_pump(mut self, pump: PumpSpec) -> Self {
        self.pumps.push(pump);
        self
    }

    /// Fallible build available in any type-state.
    pub fn try_build(self) -> Result<DosingHub> {
        let time = self
            .time
            .ok_or_else(|| eyre::Report::new(BuildError::MissingTimeSource))?;
        validate_and_build(
            time,
            self.watchdog_mode,
            self.scheduler,
            self.calibration,
            self.pumps,
        )
    }
}

impl HubBuilder<Set> {
    pub fn build(self) -> Result<DosingHub> {
        self.try_build()
    }
}

/// Single place where hub configuration is validated and pumps are constructed.
fn validate_and_build(
    time: Box<dyn TimeSource + Send>,
    watchdog_mode: WatchdogMode,
    scheduler: SchedulerCfg,
    calibration: CalibrationCfg,
    specs: Vec<PumpSpec>,
) -> Result<DosingHub> {
    // ── Hub-wide checks ──────────────────────────────────────────────────────
    if !(1..=usize::from(MINUTES_PER_DAY)).contains(&scheduler.max_slots) {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "max_slots must be in 1..=1440",
        )));
    }
    if calibration.test_ms == 0 {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "calibration test_ms must be > 0",
        )));
    }
    if !(calibration.max_ml_per_sec.is_finite() && calibration.max_ml_per_sec > 0.0) {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "calibration max_ml_per_sec must be > 0",
        )));
    }
    if !(calibration.min_measured_ml.is_finite() && calibration.min_measured_ml >= 0.0) {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "calibration min_measured_ml must be >= 0",
        )));
    }

    let mut seen = HashSet::with_capacity(specs.len());
    for spec in &specs {
        if spec.id.trim().is_empty() {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "pump id must not be empty",
            )));
        }
        if !seen.insert(spec.id.as_str()) {
            return Err(eyre::Report::new(BuildError::DuplicatePump(spec.id.clone())));
        }
    }

    // ── Per-pump construction ────────────────────────────────────────────────
    let hub_grace = watchdog_mode.grace_minutes();
    let mut auto_index: u32 = 0;
    let mut pumps = Vec::with_capacity(specs.len());
    for spec in specs {
        let id = spec.id.clone();
        let index = auto_index;
        if spec.mode.is_auto() {
            auto_index += 1;
        }
        let pump = build_pump(spec, index, hub_grace, &scheduler)
            .wrap_err_with(|| format!("pump '{id}'"))?;
        pumps.push(pump);
    }

    tracing::info!(
        pumps = pumps.len(),
        watchdog_mode = %watchdog_mode,
        grace_minutes = hub_grace,
        exclusive = scheduler.exclusive_actuation,
        "dosing hub built"
    );

    Ok(DosingHub::from_parts(
        pumps,
        time,
        watchdog_mode,
        scheduler.exclusive_actuation,
        calibration,
    ))
}

fn build_pump(
    spec: PumpSpec,
    auto_index: u32,
    hub_grace: u32,
    scheduler: &SchedulerCfg,
) -> Result<PumpController> {
    if !(spec.daily_target_ml.is_finite() && spec.daily_target_ml > 0.0) {
        return Err(eyre::Report::new(BuildError::InvalidConfig(
            "daily target must be > 0",
        )));
    }
    if let ScheduleMode::Auto { min_dose_ml } = spec.mode {
        if !(min_dose_ml.is_finite() && min_dose_ml > 0.0) {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "minimum dose must be > 0",
            )));
        }
    }
    if let Some(dose) = spec.dose_ml {
        if !(dose.is_finite() && dose > 0.0) {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "dose_ml must be > 0",
            )));
        }
        // Auto doses are daily / slots so the day sums to the target.
        if spec.mode.is_auto() {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "dose_ml only applies to an explicit schedule",
            )));
        }
    }
    let profile = CalibrationProfile::new(spec.ml_per_sec)?.with_calibrated_at(spec.calibrated_at);

    let schedule = spec.mode.resolve(
        spec.daily_target_ml,
        auto_index,
        scheduler.stagger_offset_min,
        scheduler.max_slots,
    )?;
    let dose_volume_ml = spec
        .dose_ml
        .unwrap_or(spec.daily_target_ml / schedule.len() as f32);
    let grace = spec.grace_minutes.unwrap_or(hub_grace);

    tracing::debug!(
        pump = %spec.id,
        slots = schedule.len(),
        dose_volume_ml,
        grace_minutes = grace,
        "pump configured"
    );

    let pump = PumpController::new(
        spec.id,
        schedule,
        spec.daily_target_ml,
        dose_volume_ml,
        profile,
        grace,
        spec.output,
    );
    Ok(match spec.enable_input {
        Some(input) => pump.with_enable_input(input),
        None => pump,
    })
}

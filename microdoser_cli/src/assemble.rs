//! Config loading, calibration state overlay and hub assembly.

use std::path::{Path, PathBuf};

use eyre::WrapErr;
use microdoser_config::{CalibrationRecord, Config, PumpCfg};
use microdoser_core::error::DoserError;
use microdoser_core::{DosingHub, PumpSpec, Result, ScheduleMode};
use microdoser_hardware::SimulatedOutput;
use microdoser_traits::{Output, TimeSource};

/// Where pump outputs come from.
#[derive(Debug, Clone, Copy)]
pub enum Backend<'a> {
    /// GPIO pins with the `hardware` feature, simulated outputs otherwise.
    Configured,
    /// Always simulated; pumps listed in `failing` refuse to turn on.
    Simulated { failing: &'a [String] },
}

impl Backend<'_> {
    pub const fn name(self) -> &'static str {
        match self {
            Backend::Simulated { .. } => "simulated",
            Backend::Configured => CONFIGURED_BACKEND,
        }
    }
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
const CONFIGURED_BACKEND: &str = "gpio";
#[cfg(not(all(feature = "hardware", target_os = "linux")))]
const CONFIGURED_BACKEND: &str = "simulated";

/// Read, parse and validate the config, then overlay persisted calibrations.
pub fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read config {}", path.display()))?;
    let mut cfg =
        microdoser_config::load_toml(&text).wrap_err_with(|| format!("parse config {}", path.display()))?;
    cfg.validate()?;

    if let Some(state) = state_path(&cfg)
        && state.exists()
    {
        let records = microdoser_config::load_calibration_state(&state)?;
        let unknown = cfg.apply_calibration_state(&records);
        for id in unknown {
            tracing::warn!(pump = %id, file = %state.display(), "calibration state for unknown pump ignored");
        }
        tracing::info!(records = records.len(), file = %state.display(), "calibration state loaded");
    }
    Ok(cfg)
}

pub fn state_path(cfg: &Config) -> Option<PathBuf> {
    cfg.calibration.state_file.as_ref().map(PathBuf::from)
}

/// Persist an accepted calibration into the state file, if one is configured.
pub fn persist_calibration(cfg: &Config, record: CalibrationRecord) -> Result<Option<PathBuf>> {
    let Some(path) = state_path(cfg) else {
        tracing::info!(pump = %record.pump_id, "no calibration.state_file configured; not persisted");
        return Ok(None);
    };
    let mut records = if path.exists() {
        microdoser_config::load_calibration_state(&path)?
    } else {
        Vec::new()
    };
    microdoser_config::upsert_calibration(&mut records, record);
    microdoser_config::save_calibration_state(&path, &records)?;
    tracing::info!(file = %path.display(), records = records.len(), "calibration state saved");
    Ok(Some(path))
}

/// Build the hub described by `cfg` on the given time source.
pub fn build_hub(
    cfg: &Config,
    time: impl TimeSource + Send + 'static,
    backend: Backend<'_>,
) -> Result<DosingHub> {
    assemble_hub(cfg, &cfg.pumps, time, backend)
}

/// Hub holding only the `target` pump. Outputs of the other pumps are never
/// opened, so a manual run cannot overlap their doses.
pub fn build_target_hub(
    cfg: &Config,
    target: &str,
    time: impl TimeSource + Send + 'static,
) -> Result<DosingHub> {
    let pump = cfg
        .pumps
        .iter()
        .find(|p| p.id == target)
        .ok_or_else(|| eyre::Report::new(DoserError::UnknownPump(target.to_owned())))?;
    assemble_hub(cfg, std::slice::from_ref(pump), time, Backend::Configured)
}

fn assemble_hub(
    cfg: &Config,
    pumps: &[PumpCfg],
    time: impl TimeSource + Send + 'static,
    backend: Backend<'_>,
) -> Result<DosingHub> {
    let mut builder = DosingHub::builder()
        .with_time_source(time)
        .with_watchdog_mode((&cfg.hub).into())
        .with_scheduler((&cfg.hub).into())
        .with_calibration((&cfg.calibration).into());
    for p in pumps {
        builder = builder.add_pump(pump_spec(p, backend)?);
    }
    builder.build().wrap_err("build dosing hub")
}

fn pump_spec(p: &PumpCfg, backend: Backend<'_>) -> Result<PumpSpec> {
    let mode = ScheduleMode::try_from(p)?;
    let output = make_output(p, backend)?;
    let mut spec = PumpSpec::new(
        p.id.clone(),
        p.daily_dose_ml,
        mode,
        p.calibration_ml_per_sec,
        output,
    )
    .with_calibrated_at(p.calibrated_at);
    if let Some(dose) = p.dose_ml {
        spec = spec.with_dose_ml(dose);
    }
    if let Some(grace) = p.watchdog_grace_min {
        spec = spec.with_grace_minutes(grace);
    }
    if matches!(backend, Backend::Configured) {
        spec = attach_enable_input(spec, p)?;
    }
    Ok(spec)
}

fn make_output(p: &PumpCfg, backend: Backend<'_>) -> Result<Box<dyn Output + Send>> {
    match backend {
        Backend::Simulated { failing } => {
            let out = SimulatedOutput::new(p.id.as_str());
            if failing.iter().any(|f| *f == p.id) {
                out.set_fail_on(true);
            }
            Ok(Box::new(out))
        }
        Backend::Configured => configured_output(p),
    }
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
fn configured_output(p: &PumpCfg) -> Result<Box<dyn Output + Send>> {
    let out = microdoser_hardware::gpio::GpioOutput::new(p.output_pin, p.output_active_low)
        .map_err(eyre::Report::new)
        .wrap_err_with(|| format!("open output pin {} for pump '{}'", p.output_pin, p.id))?;
    Ok(Box::new(out))
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn configured_output(p: &PumpCfg) -> Result<Box<dyn Output + Send>> {
    Ok(Box::new(SimulatedOutput::new(p.id.as_str())))
}

#[cfg(all(feature = "hardware", target_os = "linux"))]
fn attach_enable_input(spec: PumpSpec, p: &PumpCfg) -> Result<PumpSpec> {
    let Some(pin) = p.enable_pin else {
        return Ok(spec);
    };
    let input = microdoser_hardware::gpio::GpioEnableInput::new(pin, p.enable_active_low)
        .map_err(eyre::Report::new)
        .wrap_err_with(|| format!("open enable pin {pin} for pump '{}'", p.id))?;
    tracing::info!(pump = %p.id, pin, active_low = p.enable_active_low, "enable input attached");
    Ok(spec.with_enable_input(input))
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
fn attach_enable_input(spec: PumpSpec, p: &PumpCfg) -> Result<PumpSpec> {
    if let Some(pin) = p.enable_pin {
        tracing::warn!(pump = %p.id, pin, "enable_pin ignored without the hardware feature");
    }
    Ok(spec)
}

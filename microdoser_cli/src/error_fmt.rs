//! Human-readable error descriptions and structured JSON error formatting.

use microdoser_core::error::{BuildError, CalibrationError, DoserError, RejectReason};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingTimeSource => {
                "What happened: No time source was provided to the dosing hub.\nLikely causes: The hub builder was not wired to a clock.\nHow to fix: Pass a time source via with_time_source(...).".to_string()
            }
            BuildError::DuplicatePump(id) => format!(
                "What happened: Pump id '{id}' is configured twice.\nLikely causes: A copied [[pump]] block kept its id.\nHow to fix: Give every [[pump]] a unique id."
            ),
            BuildError::TooManySlots { slots, max } => format!(
                "What happened: A schedule needs {slots} slots but at most {max} are allowed.\nLikely causes: daily_dose_ml is large compared to min_dose_ml.\nHow to fix: Raise min_dose_ml, lower daily_dose_ml, or raise hub.max_slots (<= 1440)."
            ),
            BuildError::EmptySchedule => {
                "What happened: An explicit schedule has no entries.\nLikely causes: `schedule = []` in a [[pump]] block.\nHow to fix: List at least one \"HH:MM\" time or use min_dose_ml instead.".to_string()
            }
            BuildError::InvalidTimeOfDay { hour, minute } => format!(
                "What happened: {hour:02}:{minute:02} is not a valid time of day.\nLikely causes: Hour above 23 or minute above 59 in a schedule.\nHow to fix: Use 24h times between 00:00 and 23:59."
            ),
            BuildError::InvalidCalibration(v) => format!(
                "What happened: Calibration of {v} ml/s is not usable.\nLikely causes: calibration_ml_per_sec is zero or negative, or the state file is stale.\nHow to fix: Set a positive calibration_ml_per_sec or recalibrate the pump."
            ),
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(ce) = err.downcast_ref::<CalibrationError>() {
        return match ce {
            CalibrationError::Rejected {
                pump,
                value,
                reason,
            } => {
                let hint = match reason {
                    RejectReason::NonPositive | RejectReason::BelowMinimum(_) => {
                        "Check the measuring vessel and that the pump actually moved liquid"
                    }
                    RejectReason::AboveMaxFlow(_) => {
                        "Re-measure; raise calibration.max_ml_per_sec only for a genuinely fast pump"
                    }
                    RejectReason::ZeroTestDuration => "Set calibration.test_ms above zero",
                };
                format!(
                    "What happened: Calibration result {value} ml for pump '{pump}' was rejected ({reason}).\nLikely causes: Typo in the measured volume or an air-locked tube.\nHow to fix: {hint}, then submit again. The previous calibration is still in use."
                )
            }
            CalibrationError::ResourceBusy => {
                "What happened: Another pump is running and actuation is exclusive.\nLikely causes: A scheduled dose is in progress.\nHow to fix: Wait for the running dose to finish and try again.".to_string()
            }
            other => format!(
                "What happened: {other}.\nLikely causes: Calibration steps were run out of order.\nHow to fix: Select a pump, start calibration, wait for the test run, then submit the measured volume."
            ),
        };
    }

    if let Some(de) = err.downcast_ref::<DoserError>() {
        return match de {
            DoserError::HardwareFault(msg) => format!(
                "What happened: Pump output hardware fault ({msg}).\nLikely causes: Wrong output_pin, missing GPIO permissions, or a disconnected driver board.\nHow to fix: Check [[pump]].output_pin and wiring; make sure the process may access GPIO."
            ),
            DoserError::Hardware(msg) => format!(
                "What happened: Pump output error ({msg}).\nLikely causes: Transient driver failure.\nHow to fix: Re-run with --log-level=debug and check the output wiring."
            ),
            DoserError::UnknownPump(id) => format!(
                "What happened: No pump is configured with id '{id}'.\nLikely causes: Typo in --pump.\nHow to fix: Run `microdoser schedule` to list configured pumps."
            ),
            DoserError::Busy(id) => format!(
                "What happened: Pump '{id}' is already running.\nLikely causes: A dose or manual run is in progress.\nHow to fix: Wait for it to finish and try again."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from config loading
    let msg = format!("{err:#}");
    let lower = msg.to_ascii_lowercase();

    if lower.contains("calibration state csv must have headers") {
        return "Invalid headers in calibration state CSV. Expected 'pump_id,ml_per_sec,calibrated_at'.".to_string();
    }

    if lower.contains("parse config") {
        return format!(
            "What happened: The config file is not valid TOML for this device.\nLikely causes: Syntax error, wrong value type, or a malformed \"HH:MM\" time.\nHow to fix: Fix the config file. Details: {msg}"
        );
    }

    if lower.contains("read config") {
        return format!(
            "What happened: The config file could not be read.\nLikely causes: Wrong --config path or missing permissions.\nHow to fix: Pass --config <FILE>. Details: {msg}"
        );
    }

    if ["must be", "duplicated", "already used", "only applies", "mutually exclusive", "set either"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return format!(
            "What happened: Configuration is invalid ({msg}).\nLikely causes: Out-of-range or conflicting values.\nHow to fix: Edit the TOML config and try again."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes per error family; anything untyped returns 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if err.downcast_ref::<BuildError>().is_some() {
        return 3;
    }
    if err.downcast_ref::<CalibrationError>().is_some() {
        return 4;
    }
    if let Some(de) = err.downcast_ref::<DoserError>() {
        return match de {
            DoserError::Hardware(_) | DoserError::HardwareFault(_) => 5,
            _ => 6,
        };
    }
    1
}

fn reason_name(err: &eyre::Report) -> &'static str {
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingTimeSource => "MissingTimeSource",
            BuildError::DuplicatePump(_) => "DuplicatePump",
            BuildError::TooManySlots { .. } => "TooManySlots",
            BuildError::EmptySchedule => "EmptySchedule",
            BuildError::InvalidTimeOfDay { .. } => "InvalidTimeOfDay",
            BuildError::InvalidCalibration(_) => "InvalidCalibration",
            BuildError::InvalidConfig(_) => "InvalidConfig",
        };
    }
    if let Some(ce) = err.downcast_ref::<CalibrationError>() {
        return match ce {
            CalibrationError::Rejected { .. } => "CalibrationRejected",
            CalibrationError::ResourceBusy => "ResourceBusy",
            _ => "CalibrationState",
        };
    }
    if let Some(de) = err.downcast_ref::<DoserError>() {
        return match de {
            DoserError::Hardware(_) | DoserError::HardwareFault(_) => "Hardware",
            DoserError::UnknownPump(_) => "UnknownPump",
            DoserError::Busy(_) => "Busy",
            DoserError::Config(_) => "Config",
            DoserError::State(_) => "State",
        };
    }
    "Error"
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let mut obj = json!({
        "reason": reason_name(err),
        "code": exit_code_for_error(err),
        "message": humanize(err),
    });
    if let Some(CalibrationError::Rejected { pump, value, .. }) =
        err.downcast_ref::<CalibrationError>()
        && let Some(map) = obj.as_object_mut()
    {
        map.insert("details".into(), json!({ "pump": pump, "value": value }));
    }
    obj.to_string()
}

use thiserror::Error;

use crate::session::CalibrationPhase;

/// Runtime errors raised while operating the hub and its pumps.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DoserError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("unknown pump '{0}'")]
    UnknownPump(String),
    #[error("pump '{0}' is busy")]
    Busy(String),
}

/// Construction-time errors; the hub refuses to start on any of these.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BuildError {
    #[error("missing time source")]
    MissingTimeSource,
    #[error("duplicate pump id '{0}'")]
    DuplicatePump(String),
    #[error("schedule needs {slots} slots, more than the configured maximum of {max}")]
    TooManySlots { slots: usize, max: usize },
    #[error("schedule is empty")]
    EmptySchedule,
    #[error("invalid time of day {hour:02}:{minute:02}")]
    InvalidTimeOfDay { hour: u8, minute: u8 },
    #[error("invalid calibration: {0} ml/s (must be > 0)")]
    InvalidCalibration(f32),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

/// Why a measured calibration result was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum RejectReason {
    #[error("measured volume must be a positive number")]
    NonPositive,
    #[error("measured volume is below the minimum of {0} ml")]
    BelowMinimum(f32),
    #[error("resulting flow {0:.3} ml/s exceeds the maximum")]
    AboveMaxFlow(f32),
    #[error("test duration is zero")]
    ZeroTestDuration,
}

/// Calibration workflow errors. The target pump keeps its prior profile.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("no calibration target selected")]
    NoTarget,
    #[error("a calibration session is already active for pump '{0}'")]
    SessionActive(String),
    #[error("no calibration session is active")]
    NoSession,
    #[error("calibration session is {0}, not awaiting a result")]
    NotAwaitingResult(CalibrationPhase),
    #[error("calibration test run on pump '{0}' has not finished yet")]
    TestRunning(String),
    #[error("shared output resource is held by another pump")]
    ResourceBusy,
    #[error("calibration result {value} ml for pump '{pump}' rejected: {reason}")]
    Rejected {
        pump: String,
        value: f32,
        reason: RejectReason,
    },
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

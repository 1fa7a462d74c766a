//! Pump state and the events emitted by each tick.

use core::fmt;

use microdoser_traits::{TimeSource, WallTime};

use crate::error::{DoserError, RejectReason};
use crate::schedule::TimeOfDay;
use crate::session::CalibrationPhase;

/// Externally visible state of one pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    /// Output asserted for a scheduled dose.
    Dosing,
    Disabled,
    /// Watchdog escalation; sticky until an operator reset.
    Fault,
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PumpState::Idle => "idle",
            PumpState::Dosing => "dosing",
            PumpState::Disabled => "disabled",
            PumpState::Fault => "fault",
        })
    }
}

/// Unscheduled actuation requested by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualRunKind {
    /// Plain prime; no effect on calibration or watchdog.
    Prime,
    CalibrationPrime,
    CalibrationTest,
}

impl ManualRunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ManualRunKind::Prime => "prime",
            ManualRunKind::CalibrationPrime => "calibration_prime",
            ManualRunKind::CalibrationTest => "calibration_test",
        }
    }
}

impl fmt::Display for ManualRunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Disabled,
    Fault,
    Shutdown,
    Operator,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CancelReason::Disabled => "disabled",
            CancelReason::Fault => "fault",
            CancelReason::Shutdown => "shutdown",
            CancelReason::Operator => "operator",
        })
    }
}

/// Effect of a tick or operator action, tagged with the pump id.
///
/// Times (`at`) are local wall-clock seconds.
#[derive(Debug, Clone, PartialEq)]
pub enum DoseEvent {
    DoseStarted {
        pump: String,
        slot: TimeOfDay,
        volume_ml: f32,
        duration_ms: u64,
        minutes_late: u64,
    },
    DoseCompleted {
        pump: String,
        slot: TimeOfDay,
        volume_ml: f32,
        at: u64,
    },
    DoseCancelled {
        pump: String,
        slot: TimeOfDay,
        reason: CancelReason,
    },
    DoseFailed {
        pump: String,
        slot: TimeOfDay,
        error: DoserError,
    },
    /// Due, but the output resource is held; retried next tick.
    DoseQueued {
        pump: String,
        slot: TimeOfDay,
    },
    /// Too late to fire; left to the watchdog.
    DoseSkipped {
        pump: String,
        slot: TimeOfDay,
        minutes_late: u64,
    },
    FaultRaised {
        pump: String,
        missed: TimeOfDay,
        missed_at: u64,
        minutes_late: u64,
    },
    FaultCleared {
        pump: String,
    },
    Enabled {
        pump: String,
    },
    Disabled {
        pump: String,
    },
    ManualRunStarted {
        pump: String,
        kind: ManualRunKind,
        duration_ms: u64,
    },
    ManualRunFinished {
        pump: String,
        kind: ManualRunKind,
    },
    ManualRunCancelled {
        pump: String,
        kind: ManualRunKind,
        reason: CancelReason,
    },
    ManualRunFailed {
        pump: String,
        kind: ManualRunKind,
        error: DoserError,
    },
    CalibrationPhase {
        pump: String,
        phase: CalibrationPhase,
    },
    CalibrationApplied {
        pump: String,
        previous_ml_per_sec: f32,
        ml_per_sec: f32,
    },
    CalibrationRejected {
        pump: String,
        value: f32,
        reason: RejectReason,
    },
}

impl DoseEvent {
    pub fn pump(&self) -> &str {
        match self {
            DoseEvent::DoseStarted { pump, .. }
            | DoseEvent::DoseCompleted { pump, .. }
            | DoseEvent::DoseCancelled { pump, .. }
            | DoseEvent::DoseFailed { pump, .. }
            | DoseEvent::DoseQueued { pump, .. }
            | DoseEvent::DoseSkipped { pump, .. }
            | DoseEvent::FaultRaised { pump, .. }
            | DoseEvent::FaultCleared { pump }
            | DoseEvent::Enabled { pump }
            | DoseEvent::Disabled { pump }
            | DoseEvent::ManualRunStarted { pump, .. }
            | DoseEvent::ManualRunFinished { pump, .. }
            | DoseEvent::ManualRunCancelled { pump, .. }
            | DoseEvent::ManualRunFailed { pump, .. }
            | DoseEvent::CalibrationPhase { pump, .. }
            | DoseEvent::CalibrationApplied { pump, .. }
            | DoseEvent::CalibrationRejected { pump, .. } => pump,
        }
    }

    /// Stable snake_case name for logs and JSON output.
    pub fn name(&self) -> &'static str {
        match self {
            DoseEvent::DoseStarted { .. } => "dose_started",
            DoseEvent::DoseCompleted { .. } => "dose_completed",
            DoseEvent::DoseCancelled { .. } => "dose_cancelled",
            DoseEvent::DoseFailed { .. } => "dose_failed",
            DoseEvent::DoseQueued { .. } => "dose_queued",
            DoseEvent::DoseSkipped { .. } => "dose_skipped",
            DoseEvent::FaultRaised { .. } => "fault_raised",
            DoseEvent::FaultCleared { .. } => "fault_cleared",
            DoseEvent::Enabled { .. } => "enabled",
            DoseEvent::Disabled { .. } => "disabled",
            DoseEvent::ManualRunStarted { .. } => "manual_run_started",
            DoseEvent::ManualRunFinished { .. } => "manual_run_finished",
            DoseEvent::ManualRunCancelled { .. } => "manual_run_cancelled",
            DoseEvent::ManualRunFailed { .. } => "manual_run_failed",
            DoseEvent::CalibrationPhase { .. } => "calibration_phase",
            DoseEvent::CalibrationApplied { .. } => "calibration_applied",
            DoseEvent::CalibrationRejected { .. } => "calibration_rejected",
        }
    }
}

/// Snapshot of the time source taken once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickTime {
    /// `None` while the wall clock is unsynchronized.
    pub wall: Option<WallTime>,
    pub mono_ms: u64,
}

impl TickTime {
    pub fn read(time: &dyn TimeSource) -> Self {
        Self {
            wall: time.wall(),
            mono_ms: time.monotonic_ms(),
        }
    }
}

/// Components driven once per time-source tick.
pub trait Tick {
    fn tick(&mut self, now: &TickTime) -> Vec<DoseEvent>;
}

//! Hub-owned calibration session.

use core::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationPhase {
    #[default]
    Idle,
    /// Priming run in progress; output is not measured.
    Priming,
    /// Test run started (or finished); waiting for the measured volume.
    AwaitingResult,
}

impl fmt::Display for CalibrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CalibrationPhase::Idle => "idle",
            CalibrationPhase::Priming => "priming",
            CalibrationPhase::AwaitingResult => "awaiting_result",
        })
    }
}

/// At most one exists per hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationSession {
    target: String,
    phase: CalibrationPhase,
    test_duration: Duration,
    test_running: bool,
}

impl CalibrationSession {
    pub(crate) fn new(target: String, test_duration: Duration) -> Self {
        Self {
            target,
            phase: CalibrationPhase::Idle,
            test_duration,
            test_running: false,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn test_duration(&self) -> Duration {
        self.test_duration
    }

    /// True while the measured test run is still actuating.
    pub fn test_running(&self) -> bool {
        self.test_running
    }

    pub(crate) fn enter_priming(&mut self) {
        self.phase = CalibrationPhase::Priming;
        self.test_running = false;
    }

    pub(crate) fn enter_test(&mut self) {
        self.phase = CalibrationPhase::AwaitingResult;
        self.test_running = true;
    }

    pub(crate) fn finish_test(&mut self) {
        self.test_running = false;
    }
}

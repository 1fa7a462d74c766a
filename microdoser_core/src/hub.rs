//! Pump registry, tick dispatch and the shared calibration workflow.

use std::collections::HashMap;
use std::time::Duration;

use microdoser_traits::{TimeSource, WallTime};

use crate::builder::{HubBuilder, Missing};
use crate::calibration::CalibrationProfile;
use crate::config::CalibrationCfg;
use crate::error::{CalibrationError, DoserError, Result};
use crate::pump::{PumpController, StartGate};
use crate::session::{CalibrationPhase, CalibrationSession};
use crate::status::{CancelReason, DoseEvent, ManualRunKind, Tick, TickTime};
use crate::watchdog::WatchdogMode;

/// Owns every pump. Operator actions queue their events, which are returned
/// by the next tick ahead of that tick's own events.
pub struct DosingHub {
    pumps: Vec<PumpController>,
    index: HashMap<String, usize>,
    time: Box<dyn TimeSource + Send>,
    watchdog_mode: WatchdogMode,
    exclusive: bool,
    calibration: CalibrationCfg,
    selected: Option<String>,
    session: Option<CalibrationSession>,
    outbox: Vec<DoseEvent>,
}

impl core::fmt::Debug for DosingHub {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DosingHub")
            .field("pumps", &self.pumps)
            .field("watchdog_mode", &self.watchdog_mode)
            .field("exclusive", &self.exclusive)
            .field("selected", &self.selected)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl DosingHub {
    pub fn builder() -> HubBuilder<Missing> {
        HubBuilder::default()
    }

    pub(crate) fn from_parts(
        pumps: Vec<PumpController>,
        time: Box<dyn TimeSource + Send>,
        watchdog_mode: WatchdogMode,
        exclusive: bool,
        calibration: CalibrationCfg,
    ) -> Self {
        let index = pumps
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id().to_owned(), i))
            .collect();
        Self {
            pumps,
            index,
            time,
            watchdog_mode,
            exclusive,
            calibration,
            selected: None,
            session: None,
            outbox: Vec::new(),
        }
    }

    /// Pumps in registration order.
    pub fn pumps(&self) -> &[PumpController] {
        &self.pumps
    }

    pub fn pump(&self, id: &str) -> Option<&PumpController> {
        self.index.get(id).map(|&i| &self.pumps[i])
    }

    pub fn pump_ids(&self) -> impl Iterator<Item = &str> {
        self.pumps.iter().map(PumpController::id)
    }

    pub fn time_source(&self) -> &dyn TimeSource {
        &*self.time
    }

    pub fn watchdog_mode(&self) -> WatchdogMode {
        self.watchdog_mode
    }

    pub fn exclusive_actuation(&self) -> bool {
        self.exclusive
    }

    pub fn calibration_cfg(&self) -> &CalibrationCfg {
        &self.calibration
    }

    pub fn selected_target(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn session(&self) -> Option<&CalibrationSession> {
        self.session.as_ref()
    }

    pub fn calibration_phase(&self) -> CalibrationPhase {
        self.session
            .as_ref()
            .map_or(CalibrationPhase::Idle, CalibrationSession::phase)
    }

    /// Earliest monotonic deadline across all pumps.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.pumps
            .iter()
            .filter_map(PumpController::next_deadline_ms)
            .min()
    }

    /// Read the time source once and tick.
    pub fn poll(&mut self) -> Vec<DoseEvent> {
        let now = TickTime::read(&*self.time);
        self.tick(&now)
    }

    /// Events queued by operator actions since the last tick.
    pub fn drain_events(&mut self) -> Vec<DoseEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| eyre::Report::new(DoserError::UnknownPump(id.to_owned())))
    }

    fn other_actuating(&self, i: usize) -> bool {
        self.pumps
            .iter()
            .enumerate()
            .any(|(j, p)| j != i && p.is_actuating())
    }

    fn now_wall(&self) -> Option<WallTime> {
        self.time.wall()
    }

    // ── Operator actions ─────────────────────────────────────────────────────

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let i = self.index_of(id)?;
        let events = self.pumps[i].set_enabled(enabled)?;
        self.outbox.extend(events);
        Ok(())
    }

    pub fn reset_fault(&mut self, id: &str) -> Result<()> {
        let i = self.index_of(id)?;
        let event = self.pumps[i].reset_fault()?;
        self.outbox.push(event);
        Ok(())
    }

    pub fn set_grace_minutes(&mut self, id: &str, grace_minutes: u32) -> Result<()> {
        let i = self.index_of(id)?;
        self.pumps[i].set_grace_minutes(grace_minutes);
        Ok(())
    }

    /// Target for prime and calibrate actions.
    pub fn select_target(&mut self, id: &str) -> Result<()> {
        self.index_of(id)?;
        self.selected = Some(id.to_owned());
        Ok(())
    }

    /// Prime the selected target.
    pub fn prime_selected(&mut self) -> Result<()> {
        let id = self
            .selected
            .clone()
            .ok_or_else(|| eyre::Report::new(CalibrationError::NoTarget))?;
        self.prime(&id)
    }

    /// Run a pump for the priming duration. Calibration and watchdog state are
    /// left untouched.
    pub fn prime(&mut self, id: &str) -> Result<()> {
        let i = self.index_of(id)?;
        if let Some(session) = &self.session {
            if session.target() == id {
                return Err(eyre::Report::new(CalibrationError::SessionActive(
                    id.to_owned(),
                )));
            }
        }
        if self.exclusive && self.other_actuating(i) {
            return Err(eyre::Report::new(CalibrationError::ResourceBusy));
        }
        let duration = Duration::from_millis(self.calibration.prime_ms);
        let mono = self.time.monotonic_ms();
        let event = self.pumps[i].start_manual(ManualRunKind::Prime, duration, mono)?;
        self.outbox.push(event);
        Ok(())
    }

    /// Begin calibrating the selected target: prime, then the timed test run.
    pub fn start_calibration(&mut self) -> Result<()> {
        let target = self
            .selected
            .clone()
            .ok_or_else(|| eyre::Report::new(CalibrationError::NoTarget))?;
        if let Some(session) = &self.session {
            return Err(eyre::Report::new(CalibrationError::SessionActive(
                session.target().to_owned(),
            )));
        }
        let i = self.index_of(&target)?;
        if self.exclusive && self.other_actuating(i) {
            return Err(eyre::Report::new(CalibrationError::ResourceBusy));
        }

        let test = Duration::from_millis(self.calibration.test_ms);
        let mut session = CalibrationSession::new(target.clone(), test);
        let mono = self.time.monotonic_ms();
        let event = if self.calibration.prime_ms > 0 {
            let prime = Duration::from_millis(self.calibration.prime_ms);
            let ev = self.pumps[i].start_manual(ManualRunKind::CalibrationPrime, prime, mono)?;
            session.enter_priming();
            ev
        } else {
            let ev = self.pumps[i].start_manual(ManualRunKind::CalibrationTest, test, mono)?;
            session.enter_test();
            ev
        };
        tracing::info!(pump = %target, phase = %session.phase(), "calibration started");
        self.outbox.push(event);
        self.outbox.push(DoseEvent::CalibrationPhase {
            pump: target,
            phase: session.phase(),
        });
        self.session = Some(session);
        Ok(())
    }

    /// Submit the measured test-run volume. Returns the accepted flow rate.
    ///
    /// A rejected value keeps the session open for another attempt and leaves
    /// the profile unchanged.
    pub fn submit_result(&mut self, measured_ml: f32) -> Result<f32> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| eyre::Report::new(CalibrationError::NoSession))?;
        if session.phase() != CalibrationPhase::AwaitingResult {
            return Err(eyre::Report::new(CalibrationError::NotAwaitingResult(
                session.phase(),
            )));
        }
        if session.test_running() {
            return Err(eyre::Report::new(CalibrationError::TestRunning(
                session.target().to_owned(),
            )));
        }
        let target = session.target().to_owned();
        let test = session.test_duration();
        let i = self.index_of(&target)?;

        let rate = match CalibrationProfile::rate_from_measurement(measured_ml, test, &self.calibration)
        {
            Ok(rate) => rate,
            Err(reason) => {
                tracing::warn!(pump = %target, value = measured_ml, %reason, "calibration result rejected");
                self.outbox.push(DoseEvent::CalibrationRejected {
                    pump: target.clone(),
                    value: measured_ml,
                    reason,
                });
                return Err(eyre::Report::new(CalibrationError::Rejected {
                    pump: target,
                    value: measured_ml,
                    reason,
                }));
            }
        };

        let at = self.now_wall().map(WallTime::local_secs);
        let previous = self.pumps[i].apply_calibration(rate, at);
        tracing::info!(
            pump = %target,
            previous_ml_per_sec = previous,
            ml_per_sec = rate,
            "calibration applied"
        );
        self.outbox.push(DoseEvent::CalibrationApplied {
            pump: target.clone(),
            previous_ml_per_sec: previous,
            ml_per_sec: rate,
        });
        self.outbox.push(DoseEvent::CalibrationPhase {
            pump: target,
            phase: CalibrationPhase::Idle,
        });
        self.session = None;
        Ok(rate)
    }

    /// Abandon the session; a running calibration run is stopped.
    pub fn cancel_calibration(&mut self) -> Result<()> {
        let session = self
            .session
            .take()
            .ok_or_else(|| eyre::Report::new(CalibrationError::NoSession))?;
        if let Ok(i) = self.index_of(session.target()) {
            let pump = &mut self.pumps[i];
            if matches!(
                pump.manual_run_kind(),
                Some(ManualRunKind::CalibrationPrime | ManualRunKind::CalibrationTest)
            ) {
                if let Some(ev) = pump.cancel_manual(CancelReason::Operator) {
                    self.outbox.push(ev);
                }
            }
        }
        tracing::info!(pump = %session.target(), "calibration cancelled");
        self.outbox.push(DoseEvent::CalibrationPhase {
            pump: session.target().to_owned(),
            phase: CalibrationPhase::Idle,
        });
        Ok(())
    }

    /// Stop every pump and drop any calibration session.
    pub fn shutdown(&mut self) -> Vec<DoseEvent> {
        let mut events = std::mem::take(&mut self.outbox);
        for pump in &mut self.pumps {
            events.extend(pump.shutdown());
        }
        if let Some(session) = self.session.take() {
            events.push(DoseEvent::CalibrationPhase {
                pump: session.target().to_owned(),
                phase: CalibrationPhase::Idle,
            });
        }
        tracing::info!("dosing hub shut down");
        events
    }

    /// Stop every running output while keeping an open calibration session.
    ///
    /// Call before pausing the tick loop, e.g. while an operator types the
    /// measured volume. A calibration run cut short here aborts the session.
    pub fn stop_outputs(&mut self) -> Vec<DoseEvent> {
        let mut events = std::mem::take(&mut self.outbox);
        for pump in self.pumps.iter_mut().filter(|p| p.is_actuating()) {
            events.extend(pump.shutdown());
        }
        let target = self.session.as_ref().map(|s| s.target().to_owned());
        let cut_short = target.is_some_and(|t| {
            events.iter().any(|e| {
                matches!(e, DoseEvent::ManualRunCancelled { pump, kind, .. }
                    if *pump == t && *kind != ManualRunKind::Prime)
            })
        });
        if cut_short {
            self.abort_session(&mut events, "calibration run stopped");
        }
        if !events.is_empty() {
            tracing::info!(events = events.len(), "outputs stopped");
        }
        events
    }

    // ── Calibration progression ──────────────────────────────────────────────

    fn advance_session(&mut self, now: &TickTime, events: &mut Vec<DoseEvent>) {
        let Some(session) = &self.session else { return };
        let target = session.target().to_owned();
        let phase = session.phase();

        let interrupted = events.iter().any(|e| match e {
            DoseEvent::ManualRunCancelled { pump, kind, .. } => {
                *pump == target && *kind != ManualRunKind::Prime
            }
            _ => false,
        });
        if interrupted {
            self.abort_session(events, "calibration run interrupted");
            return;
        }

        let Ok(i) = self.index_of(&target) else {
            self.abort_session(events, "calibration target missing");
            return;
        };
        let running = self.pumps[i].manual_run_kind();

        match phase {
            CalibrationPhase::Priming if running != Some(ManualRunKind::CalibrationPrime) => {
                if self.exclusive && self.other_actuating(i) {
                    return;
                }
                let test = Duration::from_millis(self.calibration.test_ms);
                match self.pumps[i].start_manual(ManualRunKind::CalibrationTest, test, now.mono_ms) {
                    Ok(ev) => {
                        events.push(ev);
                        if let Some(s) = self.session.as_mut() {
                            s.enter_test();
                        }
                        tracing::info!(pump = %target, "calibration test run started");
                        events.push(DoseEvent::CalibrationPhase {
                            pump: target,
                            phase: CalibrationPhase::AwaitingResult,
                        });
                    }
                    Err(e) => {
                        let error = e
                            .downcast_ref::<DoserError>()
                            .cloned()
                            .unwrap_or_else(|| DoserError::Hardware(e.to_string()));
                        events.push(DoseEvent::ManualRunFailed {
                            pump: target,
                            kind: ManualRunKind::CalibrationTest,
                            error,
                        });
                        self.abort_session(events, "calibration test run failed to start");
                    }
                }
            }
            CalibrationPhase::AwaitingResult
                if running != Some(ManualRunKind::CalibrationTest) =>
            {
                if let Some(s) = self.session.as_mut() {
                    if s.test_running() {
                        s.finish_test();
                        tracing::info!(pump = %target, "calibration test run done; awaiting result");
                    }
                }
            }
            _ => {}
        }
    }

    fn abort_session(&mut self, events: &mut Vec<DoseEvent>, why: &'static str) {
        if let Some(session) = self.session.take() {
            tracing::warn!(pump = %session.target(), reason = why, "calibration aborted");
            events.push(DoseEvent::CalibrationPhase {
                pump: session.target().to_owned(),
                phase: CalibrationPhase::Idle,
            });
        }
    }
}

impl Tick for DosingHub {
    fn tick(&mut self, now: &TickTime) -> Vec<DoseEvent> {
        let mut events = std::mem::take(&mut self.outbox);
        for i in 0..self.pumps.len() {
            let gate = if self.exclusive && self.other_actuating(i) {
                StartGate::Held
            } else {
                StartGate::Open
            };
            events.extend(self.pumps[i].tick_gated(now, gate));
        }
        self.advance_session(now, &mut events);
        events
    }
}

//! Single-pump controller: schedule matching, dose execution and watchdog.
//!
//! The controller never blocks. A dose asserts the output and stores a
//! monotonic deadline; a later tick past the deadline de-asserts it. Every
//! path that leaves `Dosing` or ends a manual run goes through
//! `stop_output`, which always calls `turn_off`.

use std::time::Duration;

use microdoser_traits::{EnableInput, Output, WallTime};

use crate::calibration::CalibrationProfile;
use crate::error::{DoserError, Result};
use crate::hw_error::map_hw_error;
use crate::schedule::{DoseSchedule, Occurrence, TimeOfDay};
use crate::status::{CancelReason, DoseEvent, ManualRunKind, PumpState, Tick, TickTime};
use crate::util::{MILLIS_PER_SEC, SECS_PER_MINUTE, duration_ms};
use crate::watchdog::{Overdue, WatchdogMonitor};

/// Whether a due dose may assert its output on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartGate {
    Open,
    /// Shared output resource held by another pump; queue instead.
    Held,
}

#[derive(Debug, Clone, Copy)]
struct ActiveDose {
    slot: TimeOfDay,
    volume_ml: f32,
    started_wall: u64,
    started_ms: u64,
    deadline_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct ManualRun {
    kind: ManualRunKind,
    deadline_ms: u64,
}

pub struct PumpController {
    id: String,
    schedule: DoseSchedule,
    daily_target_ml: f32,
    dose_volume_ml: f32,
    profile: CalibrationProfile,
    state: PumpState,
    enabled: bool,
    watchdog: WatchdogMonitor,
    output: Box<dyn Output + Send>,
    enable_input: Option<Box<dyn EnableInput + Send>>,
    active: Option<ActiveDose>,
    manual: Option<ManualRun>,
    /// Latest occurrence already fired, skipped or failed.
    fired_through: Option<u64>,
    /// Occurrence for which `DoseQueued` was already emitted.
    queued: Option<u64>,
    last_tick_ms: Option<u64>,
    last_tick_wall: Option<u64>,
}

impl core::fmt::Debug for PumpController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PumpController")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("enabled", &self.enabled)
            .field("slots", &self.schedule.len())
            .field("dose_volume_ml", &self.dose_volume_ml)
            .field("ml_per_sec", &self.profile.ml_per_sec())
            .finish_non_exhaustive()
    }
}

impl PumpController {
    pub(crate) fn new(
        id: String,
        schedule: DoseSchedule,
        daily_target_ml: f32,
        dose_volume_ml: f32,
        profile: CalibrationProfile,
        grace_minutes: u32,
        output: Box<dyn Output + Send>,
    ) -> Self {
        Self {
            id,
            schedule,
            daily_target_ml,
            dose_volume_ml,
            profile,
            state: PumpState::Idle,
            enabled: true,
            watchdog: WatchdogMonitor::new(grace_minutes),
            output,
            enable_input: None,
            active: None,
            manual: None,
            fired_through: None,
            queued: None,
            last_tick_ms: None,
            last_tick_wall: None,
        }
    }

    pub(crate) fn with_enable_input(mut self, input: Box<dyn EnableInput + Send>) -> Self {
        self.enable_input = Some(input);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_enable_input(&self) -> bool {
        self.enable_input.is_some()
    }

    pub fn schedule(&self) -> &DoseSchedule {
        &self.schedule
    }

    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    pub fn daily_target_ml(&self) -> f32 {
        self.daily_target_ml
    }

    /// Volume dispensed per scheduled slot.
    pub fn dose_volume_ml(&self) -> f32 {
        self.dose_volume_ml
    }

    pub fn dose_duration(&self) -> Duration {
        self.profile.duration_for(self.dose_volume_ml)
    }

    pub fn watchdog(&self) -> &WatchdogMonitor {
        &self.watchdog
    }

    /// Output currently asserted by a dose or a manual run.
    pub fn is_actuating(&self) -> bool {
        self.active.is_some() || self.manual.is_some()
    }

    pub fn manual_run_kind(&self) -> Option<ManualRunKind> {
        self.manual.map(|m| m.kind)
    }

    /// Earliest monotonic deadline of the active dose or manual run.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let dose = self.active.map(|a| a.deadline_ms);
        let manual = self.manual.map(|m| m.deadline_ms);
        match (dose, manual) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn set_grace_minutes(&mut self, grace_minutes: u32) {
        self.watchdog.set_grace_minutes(grace_minutes);
    }

    /// Replace the flow rate. Returns the previous one.
    pub(crate) fn apply_calibration(&mut self, ml_per_sec: f32, at: Option<u64>) -> f32 {
        self.profile.apply(ml_per_sec, at)
    }

    /// One scheduling step. `gate` controls whether a due dose may start.
    pub fn tick_gated(&mut self, now: &TickTime, gate: StartGate) -> Vec<DoseEvent> {
        let mut events = Vec::new();

        self.finish_manual_if_due(now.mono_ms, &mut events);
        self.finish_dose_if_due(now.mono_ms, &mut events);

        if let Some(input) = &self.enable_input {
            let enabled = input.is_enabled();
            self.apply_enabled(enabled, &mut events);
        }

        if let Some(wall) = now.wall {
            if !matches!(self.state, PumpState::Fault | PumpState::Disabled) {
                self.watchdog.ensure_armed(wall);
                if self.active.is_none() {
                    self.match_schedule(now, wall, gate, &mut events);
                }
                if let Some(overdue) = self.watchdog.check(&self.schedule, wall) {
                    self.raise_fault(overdue, &mut events);
                }
            }
        }

        self.last_tick_ms = Some(now.mono_ms);
        self.last_tick_wall = now.wall.map(WallTime::local_secs);
        events
    }

    fn finish_manual_if_due(&mut self, mono_ms: u64, events: &mut Vec<DoseEvent>) {
        let Some(run) = self.manual else { return };
        if mono_ms < run.deadline_ms {
            return;
        }
        self.manual = None;
        self.stop_output("manual run finished");
        tracing::info!(pump = %self.id, kind = %run.kind, "manual run finished");
        events.push(DoseEvent::ManualRunFinished {
            pump: self.id.clone(),
            kind: run.kind,
        });
    }

    fn finish_dose_if_due(&mut self, mono_ms: u64, events: &mut Vec<DoseEvent>) {
        let Some(dose) = self.active else { return };
        if mono_ms < dose.deadline_ms {
            return;
        }
        self.active = None;
        self.stop_output("dose finished");
        if self.state == PumpState::Dosing {
            self.state = PumpState::Idle;
        }
        let at = dose.started_wall + mono_ms.saturating_sub(dose.started_ms) / MILLIS_PER_SEC;
        self.watchdog.record_completion(at);
        tracing::info!(
            pump = %self.id,
            slot = %dose.slot,
            volume_ml = dose.volume_ml,
            "dose complete"
        );
        events.push(DoseEvent::DoseCompleted {
            pump: self.id.clone(),
            slot: dose.slot,
            volume_ml: dose.volume_ml,
            at,
        });
    }

    fn match_schedule(
        &mut self,
        now: &TickTime,
        wall: WallTime,
        gate: StartGate,
        events: &mut Vec<DoseEvent>,
    ) {
        let Some(occ) = self.schedule.latest_at_or_before(wall.local_secs()) else {
            return;
        };
        if !self.watchdog.is_expected(&occ) || self.fired_through.is_some_and(|t| occ.at <= t) {
            return;
        }

        let minutes_late = self.minutes_late(occ.at, wall.local_secs(), now.mono_ms);
        if minutes_late > u64::from(self.watchdog.grace_minutes()) {
            self.fired_through = Some(occ.at);
            self.queued = None;
            tracing::warn!(pump = %self.id, slot = %occ.slot, minutes_late, "dose too late; skipped");
            events.push(DoseEvent::DoseSkipped {
                pump: self.id.clone(),
                slot: occ.slot,
                minutes_late,
            });
            return;
        }

        if self.manual.is_some() || gate == StartGate::Held {
            if self.queued != Some(occ.at) {
                self.queued = Some(occ.at);
                tracing::debug!(pump = %self.id, slot = %occ.slot, "dose queued");
                events.push(DoseEvent::DoseQueued {
                    pump: self.id.clone(),
                    slot: occ.slot,
                });
            }
            return;
        }

        self.start_dose(occ, wall, now.mono_ms, minutes_late, events);
    }

    /// Lateness of an occurrence in whole minutes. The monotonic gap since the
    /// previous tick is not counted when that tick could not have seen it.
    fn minutes_late(&self, occ_at: u64, wall_secs: u64, mono_ms: u64) -> u64 {
        let late = wall_secs.saturating_sub(occ_at);
        let seen_before = self.last_tick_wall.is_some_and(|p| occ_at <= p);
        let forgiven = if seen_before {
            0
        } else {
            self.last_tick_ms
                .map_or(late, |t| mono_ms.saturating_sub(t) / MILLIS_PER_SEC)
        };
        late.saturating_sub(forgiven) / SECS_PER_MINUTE
    }

    fn start_dose(
        &mut self,
        occ: Occurrence,
        wall: WallTime,
        mono_ms: u64,
        minutes_late: u64,
        events: &mut Vec<DoseEvent>,
    ) {
        self.fired_through = Some(occ.at);
        self.queued = None;
        let volume_ml = self.dose_volume_ml;
        let duration_ms = duration_ms(self.profile.duration_for(volume_ml));

        match self.output.turn_on() {
            Ok(()) => {
                self.state = PumpState::Dosing;
                self.watchdog.mark_attended(&occ);
                self.active = Some(ActiveDose {
                    slot: occ.slot,
                    volume_ml,
                    started_wall: wall.local_secs(),
                    started_ms: mono_ms,
                    deadline_ms: mono_ms.saturating_add(duration_ms),
                });
                tracing::info!(
                    pump = %self.id,
                    slot = %occ.slot,
                    volume_ml,
                    duration_ms,
                    minutes_late,
                    "dose start"
                );
                events.push(DoseEvent::DoseStarted {
                    pump: self.id.clone(),
                    slot: occ.slot,
                    volume_ml,
                    duration_ms,
                    minutes_late,
                });
            }
            Err(e) => {
                let error = map_hw_error(&*e);
                tracing::error!(pump = %self.id, slot = %occ.slot, error = %error, "dose start failed");
                self.stop_output("dose start failure");
                events.push(DoseEvent::DoseFailed {
                    pump: self.id.clone(),
                    slot: occ.slot,
                    error,
                });
            }
        }
    }

    fn raise_fault(&mut self, overdue: Overdue, events: &mut Vec<DoseEvent>) {
        self.cancel_all(CancelReason::Fault, events);
        self.state = PumpState::Fault;
        tracing::error!(
            pump = %self.id,
            missed = %overdue.slot,
            minutes_late = overdue.minutes_late,
            grace_minutes = self.watchdog.grace_minutes(),
            "watchdog fault: scheduled dose overdue"
        );
        events.push(DoseEvent::FaultRaised {
            pump: self.id.clone(),
            missed: overdue.slot,
            missed_at: overdue.at,
            minutes_late: overdue.minutes_late,
        });
    }

    /// Cancel any active dose and manual run; the output is always de-asserted.
    fn cancel_all(&mut self, reason: CancelReason, events: &mut Vec<DoseEvent>) {
        if let Some(dose) = self.active.take() {
            if self.state == PumpState::Dosing {
                self.state = PumpState::Idle;
            }
            tracing::warn!(pump = %self.id, slot = %dose.slot, %reason, "dose cancelled");
            events.push(DoseEvent::DoseCancelled {
                pump: self.id.clone(),
                slot: dose.slot,
                reason,
            });
        }
        if let Some(run) = self.manual.take() {
            tracing::warn!(pump = %self.id, kind = %run.kind, %reason, "manual run cancelled");
            events.push(DoseEvent::ManualRunCancelled {
                pump: self.id.clone(),
                kind: run.kind,
                reason,
            });
        }
        self.stop_output("cancel");
    }

    fn apply_enabled(&mut self, enabled: bool, events: &mut Vec<DoseEvent>) {
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            if self.state == PumpState::Disabled {
                self.state = PumpState::Idle;
            }
            self.watchdog.request_rearm();
            tracing::info!(pump = %self.id, "pump enabled");
            events.push(DoseEvent::Enabled {
                pump: self.id.clone(),
            });
        } else {
            self.cancel_all(CancelReason::Disabled, events);
            if self.state != PumpState::Fault {
                self.state = PumpState::Disabled;
            }
            tracing::info!(pump = %self.id, "pump disabled");
            events.push(DoseEvent::Disabled {
                pump: self.id.clone(),
            });
        }
    }

    /// Operator enable toggle. Refused when an enable input is attached.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<Vec<DoseEvent>> {
        if self.enable_input.is_some() {
            return Err(eyre::Report::new(DoserError::State(format!(
                "pump '{}' follows its enable input",
                self.id
            ))));
        }
        let mut events = Vec::new();
        self.apply_enabled(enabled, &mut events);
        Ok(events)
    }

    /// Leave `Fault`. Occurrences up to the current minute are not re-fired.
    pub fn reset_fault(&mut self) -> Result<DoseEvent> {
        if self.state != PumpState::Fault {
            return Err(eyre::Report::new(DoserError::State(format!(
                "pump '{}' is {}, not faulted",
                self.id, self.state
            ))));
        }
        self.state = if self.enabled {
            PumpState::Idle
        } else {
            PumpState::Disabled
        };
        self.watchdog.request_rearm();
        tracing::info!(pump = %self.id, "fault cleared by operator");
        Ok(DoseEvent::FaultCleared {
            pump: self.id.clone(),
        })
    }

    /// Run the output for `duration` outside the schedule.
    ///
    /// Neither the calibration profile nor the watchdog record is touched.
    pub fn start_manual(
        &mut self,
        kind: ManualRunKind,
        duration: Duration,
        mono_ms: u64,
    ) -> Result<DoseEvent> {
        if self.is_actuating() {
            return Err(eyre::Report::new(DoserError::Busy(self.id.clone())));
        }
        if self.state == PumpState::Disabled {
            return Err(eyre::Report::new(DoserError::State(format!(
                "pump '{}' is disabled",
                self.id
            ))));
        }
        if let Err(e) = self.output.turn_on() {
            let error = map_hw_error(&*e);
            tracing::error!(pump = %self.id, %kind, error = %error, "manual run failed to start");
            self.stop_output("manual start failure");
            return Err(eyre::Report::new(error));
        }
        let duration_ms = duration_ms(duration);
        self.manual = Some(ManualRun {
            kind,
            deadline_ms: mono_ms.saturating_add(duration_ms),
        });
        tracing::info!(pump = %self.id, %kind, duration_ms, "manual run start");
        Ok(DoseEvent::ManualRunStarted {
            pump: self.id.clone(),
            kind,
            duration_ms,
        })
    }

    /// Stop a manual run early.
    pub fn cancel_manual(&mut self, reason: CancelReason) -> Option<DoseEvent> {
        let run = self.manual.take()?;
        self.stop_output("manual run cancelled");
        tracing::info!(pump = %self.id, kind = %run.kind, %reason, "manual run cancelled");
        Some(DoseEvent::ManualRunCancelled {
            pump: self.id.clone(),
            kind: run.kind,
            reason,
        })
    }

    /// Cancel everything and de-assert the output.
    pub fn shutdown(&mut self) -> Vec<DoseEvent> {
        let mut events = Vec::new();
        self.cancel_all(CancelReason::Shutdown, &mut events);
        events
    }

    fn stop_output(&mut self, context: &'static str) {
        if let Err(e) = self.output.turn_off() {
            tracing::warn!(pump = %self.id, error = %e, context, "output turn_off failed");
        }
    }
}

impl Tick for PumpController {
    fn tick(&mut self, now: &TickTime) -> Vec<DoseEvent> {
        self.tick_gated(now, StartGate::Open)
    }
}

impl Drop for PumpController {
    fn drop(&mut self) {
        if self.is_actuating() {
            self.stop_output("drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{Edge, SpyOutput};

    fn pump_at(slots: &[(u8, u8)], grace: u32) -> (PumpController, SpyOutput) {
        let spy = SpyOutput::new();
        let schedule =
            DoseSchedule::from_entries(slots.iter().map(|&(h, m)| TimeOfDay::new(h, m).unwrap()));
        let pump = PumpController::new(
            "p1".into(),
            schedule,
            10.0,
            10.0,
            CalibrationProfile::new(2.0).unwrap(),
            grace,
            Box::new(spy.clone()),
        );
        (pump, spy)
    }

    fn at(day: u64, h: u8, m: u8, s: u8, mono_ms: u64) -> TickTime {
        TickTime {
            wall: Some(WallTime::from_day_hms(day, h, m, s)),
            mono_ms,
        }
    }

    #[test]
    fn fires_once_per_occurrence() {
        let (mut pump, spy) = pump_at(&[(8, 0)], 0);
        pump.tick(&at(1, 7, 59, 0, 0));
        let ev = pump.tick(&at(1, 8, 0, 0, 60_000));
        assert!(matches!(ev.as_slice(), [DoseEvent::DoseStarted { .. }]));
        assert_eq!(pump.state(), PumpState::Dosing);
        assert!(spy.is_on());
        let ev = pump.tick(&at(1, 8, 0, 5, 65_000));
        assert!(matches!(ev.as_slice(), [DoseEvent::DoseCompleted { at, .. }] if *at == WallTime::from_day_hms(1, 8, 0, 5).local_secs()));
        assert!(pump.tick(&at(1, 8, 0, 30, 90_000)).is_empty());
        assert_eq!(spy.history(), vec![Edge::On, Edge::Off]);
        assert_eq!(pump.state(), PumpState::Idle);
    }

    #[test]
    fn unsynced_time_never_doses() {
        let (mut pump, spy) = pump_at(&[(8, 0)], 0);
        let ev = pump.tick(&TickTime { wall: None, mono_ms: 0 });
        assert!(ev.is_empty());
        assert!(spy.history().is_empty());
    }

    #[test]
    fn failed_turn_on_reports_and_deasserts() {
        let (mut pump, spy) = pump_at(&[(8, 0)], 10);
        spy.set_fail_on(true);
        pump.tick(&at(1, 7, 59, 0, 0));
        let ev = pump.tick(&at(1, 8, 0, 0, 60_000));
        assert!(matches!(ev.as_slice(), [DoseEvent::DoseFailed { .. }]));
        assert_eq!(spy.history(), vec![Edge::Off]);
        assert_eq!(pump.state(), PumpState::Idle);
    }

    #[test]
    fn reset_requires_fault() {
        let (mut pump, _spy) = pump_at(&[(8, 0)], 0);
        assert!(pump.reset_fault().is_err());
    }

    #[test]
    fn manual_run_rejected_while_dosing() {
        let (mut pump, _spy) = pump_at(&[(8, 0)], 0);
        pump.tick(&at(1, 8, 0, 0, 0));
        let err = pump
            .start_manual(ManualRunKind::Prime, Duration::from_secs(1), 0)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DoserError>(),
            Some(&DoserError::Busy("p1".into()))
        );
    }

    #[test]
    fn turn_off_failure_still_leaves_dosing() {
        let (mut pump, spy) = pump_at(&[(8, 0)], 0);
        pump.tick(&at(1, 8, 0, 0, 0));
        spy.set_fail_off(true);
        let ev = pump.tick(&at(1, 8, 0, 10, 10_000));
        assert!(matches!(ev.as_slice(), [DoseEvent::DoseCompleted { .. }]));
        assert_eq!(pump.state(), PumpState::Idle);
        assert!(!spy.is_on());
    }

    #[test]
    fn drop_deasserts_active_output() {
        let (mut pump, spy) = pump_at(&[(8, 0)], 0);
        pump.tick(&at(1, 8, 0, 0, 0));
        assert!(spy.is_on());
        drop(pump);
        assert!(!spy.is_on());
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use microdoser_core::mocks::{Edge, SpyOutput};
use microdoser_core::{
    CalibrationCfg, CalibrationError, CalibrationPhase, CalibrationProfile, CancelReason,
    DoseEvent, DoserError, DosingHub, ManualRunKind, PumpSpec, RejectReason, ScheduleMode,
    SchedulerCfg, TimeOfDay,
};
use microdoser_traits::{ManualTimeSource, WallTime};
use proptest::prelude::*;
use rstest::{fixture, rstest};

struct Rig {
    hub: DosingHub,
    time: ManualTimeSource,
    a: SpyOutput,
    b: SpyOutput,
    a_enabled: Arc<AtomicBool>,
}

impl Rig {
    fn step(&mut self, secs: u64) -> Vec<DoseEvent> {
        self.time.advance(Duration::from_secs(secs));
        self.hub.poll()
    }

    fn rate(&self, id: &str) -> f32 {
        self.hub.pump(id).unwrap().profile().ml_per_sec()
    }
}

fn build(cal: CalibrationCfg, exclusive: bool) -> Rig {
    let time = ManualTimeSource::at(WallTime::from_day_hms(0, 9, 0, 0));
    let (a, b) = (SpyOutput::new(), SpyOutput::new());
    let a_enabled = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&a_enabled);
    let explicit = |h| ScheduleMode::Explicit(vec![TimeOfDay::new(h, 0).unwrap()]);
    let mut hub = DosingHub::builder()
        .with_time_source(time.clone())
        .with_calibration(cal)
        .with_scheduler(SchedulerCfg {
            exclusive_actuation: exclusive,
            ..SchedulerCfg::default()
        })
        .add_pump(
            PumpSpec::new("a", 12.0, explicit(12), 1.0, a.clone())
                .with_enable_input(move || flag.load(Ordering::Relaxed)),
        )
        .add_pump(PumpSpec::new("b", 12.0, explicit(13), 1.0, b.clone()))
        .build()
        .unwrap();
    assert!(hub.poll().is_empty());
    Rig {
        hub,
        time,
        a,
        b,
        a_enabled,
    }
}

#[fixture]
fn rig() -> Rig {
    build(CalibrationCfg::default(), false)
}

fn calibration_error(err: &eyre::Report) -> &CalibrationError {
    err.downcast_ref::<CalibrationError>()
        .unwrap_or_else(|| panic!("expected CalibrationError, got {err:?}"))
}

#[rstest]
fn full_workflow_updates_profile(mut rig: Rig) {
    rig.hub.select_target("a").unwrap();
    rig.hub.start_calibration().unwrap();
    assert_eq!(rig.hub.calibration_phase(), CalibrationPhase::Priming);
    let ev = rig.hub.poll();
    assert!(matches!(
        ev.as_slice(),
        [
            DoseEvent::ManualRunStarted {
                kind: ManualRunKind::CalibrationPrime,
                duration_ms: 10_000,
                ..
            },
            DoseEvent::CalibrationPhase {
                phase: CalibrationPhase::Priming,
                ..
            }
        ]
    ));
    assert!(rig.a.is_on());

    let ev = rig.step(10);
    assert!(matches!(
        ev.as_slice(),
        [
            DoseEvent::ManualRunFinished {
                kind: ManualRunKind::CalibrationPrime,
                ..
            },
            DoseEvent::ManualRunStarted {
                kind: ManualRunKind::CalibrationTest,
                ..
            },
            DoseEvent::CalibrationPhase {
                phase: CalibrationPhase::AwaitingResult,
                ..
            }
        ]
    ));
    assert!(rig.a.is_on());
    assert!(rig.hub.session().unwrap().test_running());

    let ev = rig.step(10);
    assert!(matches!(
        ev.as_slice(),
        [DoseEvent::ManualRunFinished {
            kind: ManualRunKind::CalibrationTest,
            ..
        }]
    ));
    assert!(!rig.a.is_on());
    assert_eq!(rig.a.history(), vec![Edge::On, Edge::Off, Edge::On, Edge::Off]);

    let rate = rig.hub.submit_result(12.0).unwrap();
    assert!((rate - 1.2).abs() < 1e-6);
    assert!((rig.rate("a") - 1.2).abs() < 1e-6);
    assert_eq!(
        rig.hub.pump("a").unwrap().profile().calibrated_at(),
        Some(WallTime::from_day_hms(0, 9, 0, 20).local_secs())
    );
    assert!(rig.hub.session().is_none());
    let ev = rig.hub.poll();
    assert!(matches!(
        ev.as_slice(),
        [
            DoseEvent::CalibrationApplied { .. },
            DoseEvent::CalibrationPhase {
                phase: CalibrationPhase::Idle,
                ..
            }
        ]
    ));
    // Calibration never touched the other pump or the watchdog record.
    assert_eq!(rig.rate("b"), 1.0);
    assert!(rig.hub.pump("a").unwrap().watchdog().record().last_dose_at.is_none());
}

#[rstest]
fn zero_result_is_rejected_and_retry_allowed(mut rig: Rig) {
    rig.hub.select_target("a").unwrap();
    rig.hub.start_calibration().unwrap();
    rig.step(10);
    rig.step(10);

    let err = rig.hub.submit_result(0.0).unwrap_err();
    assert_eq!(
        calibration_error(&err),
        &CalibrationError::Rejected {
            pump: "a".into(),
            value: 0.0,
            reason: RejectReason::NonPositive
        }
    );
    assert_eq!(rig.rate("a"), 1.0);
    assert_eq!(rig.hub.calibration_phase(), CalibrationPhase::AwaitingResult);
    let ev = rig.hub.poll();
    assert!(matches!(ev.as_slice(), [DoseEvent::CalibrationRejected { .. }]));

    assert!(rig.hub.submit_result(8.0).is_ok());
    assert!((rig.rate("a") - 0.8).abs() < 1e-6);
}

#[rstest]
fn pump_keeps_dosing_after_rejected_result(mut rig: Rig) {
    rig.hub.select_target("a").unwrap();
    rig.hub.start_calibration().unwrap();
    rig.step(10);
    rig.step(10);
    let err = rig.hub.submit_result(-3.0).unwrap_err();
    assert!(matches!(
        calibration_error(&err),
        CalibrationError::Rejected { .. }
    ));

    // 09:00:20 → 12:00:00
    let ev = rig.step(3 * 3_600 - 20);
    assert!(ev.iter().any(|e| matches!(
        e,
        DoseEvent::DoseStarted { pump, duration_ms: 12_000, .. } if pump == "a"
    )));
}

#[rstest]
fn workflow_errors(mut rig: Rig) {
    let err = rig.hub.start_calibration().unwrap_err();
    assert_eq!(calibration_error(&err), &CalibrationError::NoTarget);

    let err = rig.hub.select_target("zzz").unwrap_err();
    assert_eq!(
        err.downcast_ref::<DoserError>(),
        Some(&DoserError::UnknownPump("zzz".into()))
    );

    let err = rig.hub.submit_result(5.0).unwrap_err();
    assert_eq!(calibration_error(&err), &CalibrationError::NoSession);

    rig.hub.select_target("a").unwrap();
    rig.hub.start_calibration().unwrap();
    let err = rig.hub.start_calibration().unwrap_err();
    assert_eq!(
        calibration_error(&err),
        &CalibrationError::SessionActive("a".into())
    );
    let err = rig.hub.submit_result(5.0).unwrap_err();
    assert_eq!(
        calibration_error(&err),
        &CalibrationError::NotAwaitingResult(CalibrationPhase::Priming)
    );
    let err = rig.hub.prime("a").unwrap_err();
    assert_eq!(
        calibration_error(&err),
        &CalibrationError::SessionActive("a".into())
    );

    rig.step(10);
    let err = rig.hub.submit_result(5.0).unwrap_err();
    assert_eq!(
        calibration_error(&err),
        &CalibrationError::TestRunning("a".into())
    );
}

#[rstest]
fn cancel_stops_the_run(mut rig: Rig) {
    rig.hub.select_target("a").unwrap();
    rig.hub.start_calibration().unwrap();
    rig.step(10);
    assert!(rig.a.is_on());

    rig.hub.cancel_calibration().unwrap();
    assert!(!rig.a.is_on());
    assert!(rig.hub.session().is_none());
    let ev = rig.hub.poll();
    assert!(ev.iter().any(|e| matches!(
        e,
        DoseEvent::ManualRunCancelled {
            kind: ManualRunKind::CalibrationTest,
            reason: CancelReason::Operator,
            ..
        }
    )));
    let err = rig.hub.cancel_calibration().unwrap_err();
    assert_eq!(calibration_error(&err), &CalibrationError::NoSession);
}

#[rstest]
fn disabling_the_target_aborts_the_session(mut rig: Rig) {
    rig.hub.select_target("a").unwrap();
    rig.hub.start_calibration().unwrap();
    rig.hub.poll();

    rig.a_enabled.store(false, Ordering::Relaxed);
    let ev = rig.step(1);
    assert!(!rig.a.is_on());
    assert!(rig.hub.session().is_none());
    assert!(ev.iter().any(|e| matches!(
        e,
        DoseEvent::ManualRunCancelled {
            reason: CancelReason::Disabled,
            ..
        }
    )));
    assert!(matches!(
        ev.last(),
        Some(DoseEvent::CalibrationPhase {
            phase: CalibrationPhase::Idle,
            ..
        })
    ));
}

#[rstest]
fn zero_prime_goes_straight_to_test() {
    let mut rig = build(
        CalibrationCfg {
            prime_ms: 0,
            ..CalibrationCfg::default()
        },
        false,
    );
    rig.hub.select_target("b").unwrap();
    rig.hub.start_calibration().unwrap();
    assert_eq!(rig.hub.calibration_phase(), CalibrationPhase::AwaitingResult);
    rig.step(10);
    assert!(!rig.b.is_on());
    assert!(rig.hub.submit_result(20.0).is_ok());
    assert!((rig.rate("b") - 2.0).abs() < 1e-6);
}

#[rstest]
fn flow_above_maximum_is_rejected() {
    let mut rig = build(
        CalibrationCfg {
            prime_ms: 0,
            max_ml_per_sec: 5.0,
            ..CalibrationCfg::default()
        },
        false,
    );
    rig.hub.select_target("a").unwrap();
    rig.hub.start_calibration().unwrap();
    rig.step(10);
    let err = rig.hub.submit_result(60.0).unwrap_err();
    assert!(matches!(
        calibration_error(&err),
        CalibrationError::Rejected {
            reason: RejectReason::AboveMaxFlow(_),
            ..
        }
    ));
    assert_eq!(rig.rate("a"), 1.0);
}

#[rstest]
fn exclusive_hub_refuses_calibration_while_another_pump_runs() {
    let mut rig = build(CalibrationCfg::default(), true);
    rig.hub.prime("b").unwrap();
    rig.hub.select_target("a").unwrap();
    let err = rig.hub.start_calibration().unwrap_err();
    assert_eq!(calibration_error(&err), &CalibrationError::ResourceBusy);
    rig.step(10);
    assert!(rig.hub.start_calibration().is_ok());
}

#[rstest]
fn prime_leaves_profile_and_watchdog_alone(mut rig: Rig) {
    rig.hub.select_target("b").unwrap();
    rig.hub.prime_selected().unwrap();
    assert!(rig.b.is_on());
    let err = rig.hub.prime("b").unwrap_err();
    assert_eq!(
        err.downcast_ref::<DoserError>(),
        Some(&DoserError::Busy("b".into()))
    );

    let ev = rig.step(10);
    assert!(ev.iter().any(|e| matches!(
        e,
        DoseEvent::ManualRunFinished {
            kind: ManualRunKind::Prime,
            ..
        }
    )));
    assert!(!rig.b.is_on());
    let pump = rig.hub.pump("b").unwrap();
    assert_eq!(pump.profile().ml_per_sec(), 1.0);
    assert!(pump.watchdog().record().last_dose_at.is_none());
}

#[rstest]
fn waiting_for_a_result_leaves_no_output_running() {
    let time = ManualTimeSource::at(WallTime::from_day_hms(0, 8, 0, 30));
    let (a, b) = (SpyOutput::new(), SpyOutput::new());
    let explicit = |h| ScheduleMode::Explicit(vec![TimeOfDay::new(h, 0).unwrap()]);
    let mut hub = DosingHub::builder()
        .with_time_source(time.clone())
        .add_pump(PumpSpec::new("a", 12.0, explicit(12), 1.0, a.clone()))
        .add_pump(PumpSpec::new("b", 60.0, explicit(8), 1.0, b.clone()))
        .build()
        .unwrap();
    hub.select_target("a").unwrap();
    hub.start_calibration().unwrap();

    for _ in 0..60 {
        hub.poll();
        if hub
            .session()
            .is_some_and(|s| s.phase() == CalibrationPhase::AwaitingResult && !s.test_running())
        {
            break;
        }
        time.advance(Duration::from_secs(1));
    }
    assert_eq!(hub.calibration_phase(), CalibrationPhase::AwaitingResult);
    assert!(b.is_on(), "b's 08:00 dose runs alongside the calibration");

    let events = hub.stop_outputs();
    assert!(!a.is_on());
    assert!(!b.is_on());
    assert!(events.iter().any(|e| matches!(
        e,
        DoseEvent::DoseCancelled { pump, reason: CancelReason::Shutdown, .. } if pump == "b"
    )));
    assert_eq!(hub.calibration_phase(), CalibrationPhase::AwaitingResult);
    assert!((hub.submit_result(10.0).unwrap() - 1.0).abs() < 1e-6);
}

#[rstest]
fn stopping_outputs_mid_test_aborts_the_session(mut rig: Rig) {
    rig.hub.select_target("a").unwrap();
    rig.hub.start_calibration().unwrap();
    rig.step(10);
    rig.step(1);
    assert!(rig.a.is_on());

    let events = rig.hub.stop_outputs();
    assert!(!rig.a.is_on());
    assert!(events.iter().any(|e| matches!(
        e,
        DoseEvent::CalibrationPhase { phase: CalibrationPhase::Idle, .. }
    )));
    assert!(rig.hub.session().is_none());
}

proptest! {
    #[test]
    fn rate_round_trips_to_test_duration(volume in 0.5f32..500.0, secs in 1u64..600) {
        let cfg = CalibrationCfg { max_ml_per_sec: f32::MAX, ..CalibrationCfg::default() };
        let test = Duration::from_secs(secs);
        let rate = CalibrationProfile::rate_from_measurement(volume, test, &cfg).unwrap();
        let profile = CalibrationProfile::new(rate).unwrap();
        let back = profile.duration_for(volume).as_secs_f64();
        prop_assert!((back - secs as f64).abs() <= secs as f64 * 1e-5);
    }
}

//! Subcommand implementations.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use eyre::WrapErr;
use microdoser_config::{CalibrationRecord, Config};
use microdoser_core::error::DoserError;
use microdoser_core::runner::{self, RunParams, RunStats};
use microdoser_core::{CalibrationPhase, DosingHub, Result};
use microdoser_traits::{ManualTimeSource, SystemTimeSource, TimeSource, WallTime};
use serde_json::json;

use crate::assemble::{Backend, build_hub, build_target_hub, persist_calibration};
use crate::events::{Printer, clock};

/// Shutdown flag set by Ctrl-C.
fn install_shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let f = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        f.store(true, Ordering::Relaxed);
    })
    .wrap_err("install Ctrl-C handler")?;
    Ok(flag)
}

fn system_time(cfg: &Config) -> SystemTimeSource {
    SystemTimeSource::new(cfg.hub.utc_offset_min)
}

/// System time with the wall clock withheld from the hub: deadlines still
/// run, schedule matching and the watchdog stay suspended.
#[derive(Debug, Clone, Copy)]
struct ManualRunClock(SystemTimeSource);

impl TimeSource for ManualRunClock {
    fn wall(&self) -> Option<WallTime> {
        None
    }
    fn monotonic_ms(&self) -> u64 {
        self.0.monotonic_ms()
    }
    fn sleep(&self, d: Duration) {
        self.0.sleep(d)
    }
}

fn manual_hub(cfg: &Config, pump: &str) -> Result<DosingHub> {
    build_target_hub(cfg, pump, ManualRunClock(system_time(cfg)))
}

fn print_stats(stats: &RunStats, hub: &DosingHub, printer: Printer) {
    if printer.json {
        let pumps: Vec<_> = hub
            .pumps()
            .iter()
            .map(|p| {
                json!({
                    "pump": p.id(),
                    "state": p.state().to_string(),
                    "last_dose_at": p.watchdog().record().last_dose_at,
                })
            })
            .collect();
        println!(
            "{}",
            json!({
                "summary": {
                    "ticks": stats.ticks,
                    "events": stats.events,
                    "doses_completed": stats.doses_completed,
                    "faults": stats.faults,
                },
                "pumps": pumps,
            })
        );
    } else {
        println!(
            "stopped after {} ticks: {} doses completed, {} faults",
            stats.ticks, stats.doses_completed, stats.faults
        );
        for p in hub.pumps() {
            println!("  {:<12} {}", p.id(), p.state());
        }
    }
}

pub fn run(cfg: &Config, max_ticks: Option<u64>, printer: Printer) -> Result<()> {
    let shutdown = install_shutdown_flag()?;
    let mut hub = build_hub(cfg, system_time(cfg), Backend::Configured)?;
    let params = RunParams {
        tick: Duration::from_millis(cfg.hub.tick_ms),
        max_ticks,
        ..RunParams::default()
    };
    let time = system_time(cfg);
    let stats = runner::run(&mut hub, &params, &shutdown, |ev| {
        printer.emit(ev, time.wall());
    });
    print_stats(&stats, &hub, printer);
    Ok(())
}

pub struct SimulateArgs<'a> {
    pub start: (u8, u8),
    pub hours: u32,
    pub tick_ms: Option<u64>,
    pub fail_pumps: &'a [String],
    pub disabled: &'a [String],
}

/// Replay the schedule on a manual clock starting at day 0.
pub fn simulate(cfg: &Config, args: &SimulateArgs<'_>, printer: Printer) -> Result<()> {
    let (hour, minute) = args.start;
    let time = ManualTimeSource::at(WallTime::from_day_hms(0, hour, minute, 0));
    let mut hub = build_hub(
        cfg,
        time.clone(),
        Backend::Simulated {
            failing: args.fail_pumps,
        },
    )?;
    for id in args.disabled {
        hub.set_enabled(id, false)?;
    }
    let params = RunParams {
        tick: Duration::from_millis(args.tick_ms.unwrap_or(cfg.hub.tick_ms).max(1)),
        max_ticks: None,
        run_for: Some(Duration::from_secs(u64::from(args.hours) * 3_600)),
    };
    tracing::info!(start = %clock(WallTime::from_day_hms(0, hour, minute, 0)), hours = args.hours, "simulation start");
    let shutdown = AtomicBool::new(false);
    let stats = runner::run(&mut hub, &params, &shutdown, |ev| {
        printer.emit(ev, time.wall());
    });
    print_stats(&stats, &hub, printer);
    Ok(())
}

/// Print each pump's resolved schedule without touching any output.
pub fn schedule(cfg: &Config, printer: Printer) -> Result<()> {
    let hub = build_hub(cfg, ManualTimeSource::unsynced(), Backend::Simulated { failing: &[] })?;
    for p in hub.pumps() {
        let slots: Vec<String> = p.schedule().entries().iter().map(ToString::to_string).collect();
        let duration_ms = microdoser_core::util::duration_ms(p.dose_duration());
        if printer.json {
            println!(
                "{}",
                json!({
                    "pump": p.id(),
                    "daily_ml": p.daily_target_ml(),
                    "dose_ml": p.dose_volume_ml(),
                    "dose_ms": duration_ms,
                    "ml_per_sec": p.profile().ml_per_sec(),
                    "grace_minutes": p.watchdog().grace_minutes(),
                    "slots": slots,
                })
            );
        } else {
            println!(
                "{}: {} slots, {:.2} ml per dose ({} ms at {:.3} ml/s), grace {} min",
                p.id(),
                slots.len(),
                p.dose_volume_ml(),
                duration_ms,
                p.profile().ml_per_sec(),
                p.watchdog().grace_minutes()
            );
            println!("  {}", slots.join(" "));
        }
    }
    Ok(())
}

/// Poll until `done` holds, printing events stamped with `stamp`. Ctrl-C
/// stops every pump.
fn drive<F>(
    hub: &mut DosingHub,
    stamp: &dyn TimeSource,
    tick: Duration,
    shutdown: &AtomicBool,
    printer: Printer,
    mut done: F,
) -> Result<()>
where
    F: FnMut(&DosingHub) -> Result<bool>,
{
    loop {
        for ev in hub.poll() {
            printer.emit(&ev, stamp.wall());
        }
        if done(hub)? {
            return Ok(());
        }
        if shutdown.load(Ordering::Relaxed) {
            for ev in hub.shutdown() {
                printer.emit(&ev, stamp.wall());
            }
            eyre::bail!("interrupted");
        }
        let now_ms = hub.time_source().monotonic_ms();
        let sleep = hub
            .next_deadline_ms()
            .map_or(tick, |d| tick.min(Duration::from_millis(d.saturating_sub(now_ms))));
        hub.time_source().sleep(sleep);
    }
}

fn manual_tick(cfg: &Config) -> Duration {
    Duration::from_millis(cfg.hub.tick_ms.clamp(1, 100))
}

pub fn prime(cfg: &Config, pump: &str, printer: Printer) -> Result<()> {
    let shutdown = install_shutdown_flag()?;
    let stamp = system_time(cfg);
    let mut hub = manual_hub(cfg, pump)?;
    hub.select_target(pump)?;
    hub.prime_selected()?;
    let id = pump.to_owned();
    drive(&mut hub, &stamp, manual_tick(cfg), &shutdown, printer, |h| {
        Ok(h.pump(&id).is_none_or(|p| p.manual_run_kind().is_none()))
    })?;
    for ev in hub.shutdown() {
        printer.emit(&ev, stamp.wall());
    }
    Ok(())
}

fn read_measurement() -> Result<f32> {
    eprint!("Enter measured volume in ml: ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    let n = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .wrap_err("read measured volume")?;
    if n == 0 {
        eyre::bail!("no measured volume provided on stdin");
    }
    line.trim()
        .parse::<f32>()
        .wrap_err_with(|| format!("'{}' is not a number", line.trim()))
}

pub fn calibrate(
    cfg: &Config,
    pump: &str,
    measured_ml: Option<f32>,
    printer: Printer,
) -> Result<()> {
    let shutdown = install_shutdown_flag()?;
    let stamp = system_time(cfg);
    let mut hub = manual_hub(cfg, pump)?;
    hub.select_target(pump)?;
    hub.start_calibration()?;
    drive(&mut hub, &stamp, manual_tick(cfg), &shutdown, printer, |h| match h.session() {
        None => Err(eyre::Report::new(DoserError::State(
            "calibration aborted before the test run finished".into(),
        ))),
        Some(s) => Ok(s.phase() == CalibrationPhase::AwaitingResult && !s.test_running()),
    })?;
    // No ticks run while waiting on the operator.
    for ev in hub.stop_outputs() {
        printer.emit(&ev, stamp.wall());
    }

    loop {
        let value = match measured_ml {
            Some(v) => v,
            None => read_measurement()?,
        };
        let outcome = hub.submit_result(value);
        let now = stamp.wall();
        for ev in hub.drain_events() {
            printer.emit(&ev, now);
        }
        match outcome {
            Ok(rate) => {
                let calibrated_at = now.map(WallTime::local_secs);
                let saved = persist_calibration(
                    cfg,
                    CalibrationRecord {
                        pump_id: pump.to_owned(),
                        ml_per_sec: rate,
                        calibrated_at,
                    },
                )?;
                if !printer.json {
                    match saved {
                        Some(path) => println!("{pump}: {rate:.3} ml/s saved to {}", path.display()),
                        None => println!("{pump}: {rate:.3} ml/s (not persisted)"),
                    }
                }
                return Ok(());
            }
            Err(e) if measured_ml.is_none() => {
                eprintln!("{}", crate::error_fmt::humanize(&e));
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn self_check(cfg: &Config, printer: Printer) -> Result<()> {
    let backend = Backend::Configured;
    let hub = build_hub(cfg, system_time(cfg), backend)?;
    let synced = hub.time_source().wall().is_some();
    if !synced {
        tracing::warn!("system clock looks unsynchronized; scheduled dosing is suspended until it is");
    }
    if printer.json {
        println!(
            "{}",
            json!({
                "status": "ok",
                "backend": backend.name(),
                "pumps": hub.pumps().len(),
                "clock_synced": synced,
                "watchdog_mode": hub.watchdog_mode().to_string(),
            })
        );
    } else {
        println!(
            "OK: {} pumps on {} outputs, watchdog {}, clock {}",
            hub.pumps().len(),
            backend.name(),
            hub.watchdog_mode(),
            if synced { "synced" } else { "unsynced" }
        );
    }
    Ok(())
}

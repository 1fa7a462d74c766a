#![no_main]
use libfuzzer_sys::fuzz_target;
use microdoser_core::mocks::NoopOutput;
use microdoser_core::{DosingHub, PumpSpec, ScheduleMode};
use microdoser_traits::{ManualTimeSource, WallTime};

fuzz_target!(|data: &str| {
    // Parse and validation errors are fine; panics are not.
    let Ok(cfg) = microdoser_config::load_toml(data) else {
        return;
    };
    if cfg.validate().is_err() {
        return;
    }

    // A validated config must also build and tick without panicking.
    let time = ManualTimeSource::at(WallTime::from_day_hms(0, 0, 0, 0));
    let mut builder = DosingHub::builder()
        .with_time_source(time.clone())
        .with_watchdog_mode((&cfg.hub).into())
        .with_scheduler((&cfg.hub).into())
        .with_calibration((&cfg.calibration).into());
    for p in &cfg.pumps {
        let Ok(mode) = ScheduleMode::try_from(p) else {
            return;
        };
        builder = builder.add_pump(PumpSpec::new(
            p.id.clone(),
            p.daily_dose_ml,
            mode,
            p.calibration_ml_per_sec,
            NoopOutput,
        ));
    }
    if let Ok(mut hub) = builder.build() {
        for _ in 0..48 {
            time.advance(std::time::Duration::from_secs(1_800));
            let _ = hub.poll();
        }
    }
});

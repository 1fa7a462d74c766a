use microdoser_config::{ScheduleEntry, load_toml};
use rstest::rstest;

const BASE: &str = r#"
[hub]
watchdog_mode = "recover"
stagger_offset_min = 15
exclusive_actuation = true

[calibration]
prime_ms = 5000
test_ms = 10000

[[pump]]
id = "alk"
output_pin = 17
calibration_ml_per_sec = 1.2
daily_dose_ml = 100.0
min_dose_ml = 10.0

[[pump]]
id = "cal"
output_pin = 27
daily_dose_ml = 40.0
schedule = ["08:00", { hour = 20, minute = 30 }]
"#;

#[test]
fn accepts_mixed_auto_and_explicit_pumps() {
    let cfg = load_toml(BASE).expect("parse TOML");
    cfg.validate().expect("valid config");
    assert_eq!(cfg.pumps.len(), 2);
    assert!(cfg.pumps[0].is_auto());
    assert_eq!(cfg.hub.max_slots, 288);
    assert_eq!(cfg.hub.tick_ms, 1_000);
    assert_eq!(cfg.pumps[1].calibration_ml_per_sec, 1.0);
    assert_eq!(
        cfg.pumps[1].schedule.as_deref(),
        Some(
            &[
                ScheduleEntry { hour: 8, minute: 0 },
                ScheduleEntry {
                    hour: 20,
                    minute: 30
                }
            ][..]
        )
    );
}

#[test]
fn unknown_watchdog_mode_still_parses() {
    let toml = BASE.replace("\"recover\"", "\"paranoid\"");
    let cfg = load_toml(&toml).expect("parse TOML");
    cfg.validate().expect("mode is interpreted leniently downstream");
    assert_eq!(cfg.hub.watchdog_mode, "paranoid");
}

#[test]
fn malformed_schedule_string_is_a_parse_error() {
    let toml = BASE.replace("\"08:00\"", "\"8h00\"");
    assert!(load_toml(&toml).is_err());
}

#[rstest]
#[case("min_dose_ml = 10.0", "min_dose_ml = 0.0", "min_dose_ml must be > 0")]
#[case("daily_dose_ml = 100.0", "daily_dose_ml = -1.0", "daily_dose_ml must be > 0")]
#[case("calibration_ml_per_sec = 1.2", "calibration_ml_per_sec = 0.0", "calibration_ml_per_sec must be > 0")]
#[case("id = \"cal\"", "id = \"alk\"", "is duplicated")]
#[case("output_pin = 27", "output_pin = 17", "already used")]
#[case("test_ms = 10000", "test_ms = 0", "calibration.test_ms must be >= 1")]
#[case("stagger_offset_min = 15", "stagger_offset_min = 1440", "stagger_offset_min must be < 1440")]
#[case("\"08:00\"", "\"25:00\"", "not a valid time of day")]
#[case("min_dose_ml = 10.0", "min_dose_ml = 10.0\ndose_ml = 50.0", "dose_ml only applies to an explicit schedule")]
fn rejects_invalid_values(#[case] from: &str, #[case] to: &str, #[case] msg: &str) {
    let toml = BASE.replacen(from, to, 1);
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should reject");
    assert!(
        format!("{err}").contains(msg),
        "expected '{msg}' in '{err}'"
    );
}

#[test]
fn rejects_pump_without_schedule_mode() {
    let toml = BASE.replace("min_dose_ml = 10.0\n", "");
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("neither mode set");
    assert!(format!("{err}").contains("set either schedule"));
}

#[test]
fn rejects_both_schedule_modes() {
    let toml = BASE.replace(
        "schedule = [",
        "min_dose_ml = 5.0\nschedule = [",
    );
    let cfg = load_toml(&toml).expect("parse TOML");
    let err = cfg.validate().expect_err("both modes set");
    assert!(format!("{err}").contains("mutually exclusive"));
}

#[test]
fn rejects_empty_pump_list() {
    let cfg = load_toml("[hub]\nwatchdog_mode = \"off\"\n").expect("parse TOML");
    let err = cfg.validate().expect_err("no pumps");
    assert!(format!("{err}").contains("at least one [[pump]]"));
}

#[test]
fn rejects_unknown_rotation() {
    let toml = format!("{BASE}\n[logging]\nrotation = \"weekly\"\n");
    let cfg = load_toml(&toml).expect("parse TOML");
    assert!(cfg.validate().is_err());
}

#[test]
fn shipped_sample_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../etc/microdoser.toml");
    let text = std::fs::read_to_string(path).expect("read sample config");
    let cfg = load_toml(&text).expect("parse sample config");
    cfg.validate().expect("sample config validates");
    let alk = cfg.pumps.iter().find(|p| p.id == "alk").unwrap();
    assert_eq!(alk.enable_pin, Some(5));
    assert!(alk.enable_active_low);
}

use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::path::{Path, PathBuf};
use assert_cmd::Command;
use tempfile::tempdir;

// Two pumps on the simulated backend: one auto-scheduled, one explicit.
fn write_valid_config(dir: &tempfile::TempDir) -> PathBuf {
    let state = dir.path().join("calibration.csv");
    let toml = format!(
        r#"
[hub]
watchdog_mode = "recover"
tick_ms = 10

[calibration]
prime_ms = 0
test_ms = 100
state_file = "{}"

[[pump]]
id = "alk"
output_pin = 17
daily_dose_ml = 40.0
min_dose_ml = 10.0
calibration_ml_per_sec = 2.0

[[pump]]
id = "cal"
output_pin = 27
daily_dose_ml = 10.0
schedule = ["08:00", "20:00"]
"#,
        state.display().to_string().replace('\\', "/")
    );
    let path = dir.path().join("cfg.toml");
    fs::write(&path, toml).unwrap();
    path
}

fn microdoser(cfg: &Path) -> Command {
    let mut cmd = Command::cargo_bin("microdoser").unwrap();
    cmd.arg("--log-level").arg("error").arg("--config").arg(cfg);
    cmd
}

#[rstest]
#[case(&["--help"], 0, "Usage:", "stdout")]
#[case(&["schedule"], 0, "alk: 4 slots, 10.00 ml per dose (5000 ms at 2.000 ml/s), grace 10 min", "stdout")]
#[case(&["self-check"], 0, "OK: 2 pumps on simulated outputs", "stdout")]
#[case(&["prime"], 2, "required", "stderr")]
#[case(&["calibrate", "--pump", "nope", "--measured-ml", "5"], 6, "No pump is configured with id 'nope'", "stderr")]
#[case(&["calibrate", "--pump", "cal", "--measured-ml", "0"], 4, "rejected", "stderr")]
#[case(&["simulate", "--start", "25:00"], 2, "not a valid time of day", "stderr")]
fn cli_table_cases(
    #[case] args: &[&str],
    #[case] exit_code: i32,
    #[case] needle: &str,
    #[case] stream: &str,
) {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir);

    let mut cmd = microdoser(&cfg);
    for a in args {
        cmd.arg(a);
    }

    let assert = cmd.assert().code(exit_code);
    match stream {
        "stdout" => {
            assert.stdout(predicate::str::contains(needle));
        }
        "stderr" => {
            assert.stderr(predicate::str::contains(needle));
        }
        other => panic!("unknown stream: {other}"),
    }
}

#[rstest]
fn schedule_lists_explicit_times() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir);
    microdoser(&cfg)
        .arg("schedule")
        .assert()
        .success()
        .stdout(predicate::str::contains("00:00 06:00 12:00 18:00"))
        .stdout(predicate::str::contains("08:00 20:00"));
}

#[rstest]
fn cli_reports_bad_state_header() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir);
    fs::write(dir.path().join("calibration.csv"), "pump,rate\ncal,1.0\n").unwrap();

    microdoser(&cfg)
        .arg("self-check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid headers"));
}

#[rstest]
fn cli_reports_duplicate_pump() {
    let dir = tempdir().unwrap();
    let cfg = dir.path().join("dup.toml");
    fs::write(
        &cfg,
        r#"
[[pump]]
id = "a"
output_pin = 1
daily_dose_ml = 5.0
min_dose_ml = 1.0

[[pump]]
id = "a"
output_pin = 2
daily_dose_ml = 5.0
min_dose_ml = 1.0
"#,
    )
    .unwrap();

    microdoser(&cfg)
        .arg("schedule")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration is invalid"));
}

#[rstest]
fn missing_config_file_is_explained() {
    let dir = tempdir().unwrap();
    microdoser(&dir.path().join("absent.toml"))
        .arg("schedule")
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not be read"));
}

#[rstest]
fn calibration_is_persisted_and_reloaded() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir);

    microdoser(&cfg)
        .args(["calibrate", "--pump", "cal", "--measured-ml", "0.5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cal: 5.000 ml/s saved to"));

    let state = fs::read_to_string(dir.path().join("calibration.csv")).unwrap();
    let mut lines = state.lines();
    assert_eq!(lines.next(), Some("pump_id,ml_per_sec,calibrated_at"));
    assert!(lines.next().is_some_and(|l| l.starts_with("cal,")));

    let out = microdoser(&cfg)
        .args(["--json", "schedule"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8_lossy(&out);
    let cal = stdout
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .find(|v| v["pump"] == "cal")
        .expect("cal schedule line");
    let rate = cal["ml_per_sec"].as_f64().unwrap();
    assert!((rate - 5.0).abs() < 1e-3, "rate was {rate}");
    assert_eq!(cal["dose_ms"], 1_000);
}

#[rstest]
fn interactive_calibration_retries_after_rejection() {
    let dir = tempdir().unwrap();
    let cfg = write_valid_config(&dir);

    microdoser(&cfg)
        .args(["calibrate", "--pump", "alk"])
        .write_stdin("0\n0.3\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("was rejected"))
        .stdout(predicate::str::contains("alk: 3.000 ml/s saved to"));
}

// `busy` has a slot in every minute of the day, so any hub that ticks it on a
// synced clock starts a dose straight away.
fn write_config_with_busy_pump(dir: &tempfile::TempDir) -> PathBuf {
    let every_minute = (0..24)
        .flat_map(|h| (0..60).map(move |m| format!("\"{h:02}:{m:02}\"")))
        .collect::<Vec<_>>()
        .join(", ");
    let toml = format!(
        r#"
[hub]
watchdog_mode = "recover"
max_slots = 1440
tick_ms = 10

[calibration]
prime_ms = 50
test_ms = 100

[[pump]]
id = "cal"
output_pin = 27
daily_dose_ml = 10.0
schedule = ["08:00"]

[[pump]]
id = "busy"
output_pin = 22
daily_dose_ml = 1440.0
calibration_ml_per_sec = 0.01
schedule = [{every_minute}]
"#
    );
    let path = dir.path().join("busy.toml");
    fs::write(&path, toml).unwrap();
    path
}

#[rstest]
#[case(&["calibrate", "--pump", "cal", "--measured-ml", "0.5"])]
#[case(&["prime", "--pump", "cal"])]
fn manual_commands_only_touch_the_target(#[case] args: &[&str]) {
    let dir = tempdir().unwrap();
    let cfg = write_config_with_busy_pump(&dir);

    let out = microdoser(&cfg)
        .arg("--json")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let events: Vec<serde_json::Value> = String::from_utf8_lossy(&out)
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    assert!(
        events.iter().any(|v| v["event"] == "manual_run_started" && v["pump"] == "cal"),
        "no manual run for cal in {events:?}"
    );
    assert!(
        events.iter().all(|v| v["pump"] != "busy"),
        "busy pump was driven: {events:?}"
    );
}

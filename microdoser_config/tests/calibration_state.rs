use std::fs;

use microdoser_config::{
    CalibrationRecord, load_calibration_state, load_toml, save_calibration_state,
    upsert_calibration,
};
use rstest::rstest;
use tempfile::tempdir;

#[rstest]
fn save_then_load_preserves_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("calibration.csv");
    let records = vec![
        CalibrationRecord {
            pump_id: "alk".into(),
            ml_per_sec: 1.25,
            calibrated_at: Some(1_767_225_600),
        },
        CalibrationRecord {
            pump_id: "cal".into(),
            ml_per_sec: 0.5,
            calibrated_at: None,
        },
    ];
    save_calibration_state(&path, &records).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("pump_id,ml_per_sec,calibrated_at\n"));
    assert!(text.contains("cal,0.5,\n"));
    assert!(!path.with_extension("new").exists());
    assert_eq!(load_calibration_state(&path).unwrap(), records);
}

#[rstest]
#[case("pump,rate,at\nalk,1.0,\n", "must have headers")]
#[case("pump_id,ml_per_sec,calibrated_at\nalk,0,\n", "ml_per_sec must be > 0")]
#[case("pump_id,ml_per_sec,calibrated_at\nalk,abc,\n", "invalid CSV row 2")]
#[case("pump_id,ml_per_sec,calibrated_at\nalk,1.0,\nalk,2.0,\n", "duplicate pump")]
fn rejects_bad_state_files(#[case] body: &str, #[case] msg: &str) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("calibration.csv");
    fs::write(&path, body).unwrap();
    let err = load_calibration_state(&path).expect_err("should reject");
    assert!(format!("{err}").contains(msg), "expected '{msg}' in '{err}'");
}

#[rstest]
fn state_overrides_configured_rate() {
    let mut cfg = load_toml(
        r#"
[[pump]]
id = "alk"
output_pin = 17
daily_dose_ml = 50.0
min_dose_ml = 5.0
"#,
    )
    .unwrap();
    let mut records = Vec::new();
    upsert_calibration(
        &mut records,
        CalibrationRecord {
            pump_id: "alk".into(),
            ml_per_sec: 2.0,
            calibrated_at: Some(42),
        },
    );
    upsert_calibration(
        &mut records,
        CalibrationRecord {
            pump_id: "gone".into(),
            ml_per_sec: 3.0,
            calibrated_at: None,
        },
    );
    let unknown = cfg.apply_calibration_state(&records);
    assert_eq!(unknown, vec!["gone".to_string()]);
    assert_eq!(cfg.pumps[0].calibration_ml_per_sec, 2.0);
    assert_eq!(cfg.pumps[0].calibrated_at, Some(42));
}

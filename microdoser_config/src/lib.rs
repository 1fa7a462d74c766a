#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Device description and calibration state for the dosing hub.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Accepted calibrations are kept in a small CSV state file with strict
//!   headers, replaced atomically on every write.
use std::collections::HashSet;
use std::path::Path;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HubCfg {
    /// "strict" | "recover" | "off"; anything else falls back to strict.
    pub watchdog_mode: String,
    /// Minutes added per auto-scheduled pump to spread actuation.
    pub stagger_offset_min: u32,
    /// Upper bound on synthesized slots per pump.
    pub max_slots: usize,
    /// Allow only one pump to run at a time.
    pub exclusive_actuation: bool,
    /// Tick loop period in milliseconds.
    pub tick_ms: u64,
    /// Local time offset from UTC used for schedule matching.
    pub utc_offset_min: i32,
}

impl Default for HubCfg {
    fn default() -> Self {
        Self {
            watchdog_mode: "strict".to_owned(),
            stagger_offset_min: 0,
            max_slots: 288,
            exclusive_actuation: false,
            tick_ms: 1_000,
            utc_offset_min: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CalibrationCfg {
    pub prime_ms: u64,
    pub test_ms: u64,
    pub min_measured_ml: f32,
    pub max_ml_per_sec: f32,
    /// CSV file holding accepted calibrations (`pump_id,ml_per_sec,calibrated_at`).
    pub state_file: Option<String>,
}

impl Default for CalibrationCfg {
    fn default() -> Self {
        Self {
            prime_ms: 10_000,
            test_ms: 10_000,
            min_measured_ml: 0.1,
            max_ml_per_sec: 50.0,
            state_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

/// One entry of an explicit schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub hour: u8,
    pub minute: u8,
}

#[derive(Debug, Deserialize)]
pub struct PumpCfg {
    pub id: String,
    /// BCM pin driving the pump relay/MOSFET.
    pub output_pin: u8,
    #[serde(default)]
    pub output_active_low: bool,
    /// Optional enable switch input; when set it is authoritative.
    #[serde(default)]
    pub enable_pin: Option<u8>,
    /// Enable switch pulls the line low when on (pull-up wiring).
    #[serde(default = "default_true")]
    pub enable_active_low: bool,
    #[serde(default = "default_ml_per_sec")]
    pub calibration_ml_per_sec: f32,
    /// Local seconds of the last accepted calibration, if known.
    #[serde(default)]
    pub calibrated_at: Option<u64>,
    pub daily_dose_ml: f32,
    /// Auto mode: synthesize slots so that each dose is at least this volume.
    #[serde(default)]
    pub min_dose_ml: Option<f32>,
    /// Explicit mode only: fixed volume per slot (default: daily / slots).
    #[serde(default)]
    pub dose_ml: Option<f32>,
    /// Explicit mode. Accepts either:
    /// - strings: ["08:00", "20:30"]
    /// - tables: [{ hour = 8, minute = 0 }, ...]
    #[serde(default, deserialize_with = "de_schedule")]
    pub schedule: Option<Vec<ScheduleEntry>>,
    /// Overrides the hub watchdog mode for this pump.
    #[serde(default)]
    pub watchdog_grace_min: Option<u32>,
}

fn default_ml_per_sec() -> f32 {
    1.0
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubCfg,
    #[serde(default)]
    pub calibration: CalibrationCfg,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default, rename = "pump")]
    pub pumps: Vec<PumpCfg>,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EntryToml {
    Text(String),
    Table { hour: u8, minute: u8 },
}

fn parse_hhmm(s: &str) -> Option<ScheduleEntry> {
    let (h, m) = s.trim().split_once(':')?;
    Some(ScheduleEntry {
        hour: h.parse().ok()?,
        minute: m.parse().ok()?,
    })
}

fn de_schedule<'de, D>(deserializer: D) -> Result<Option<Vec<ScheduleEntry>>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<Vec<EntryToml>> = Option::deserialize(deserializer)?;
    let Some(items) = opt else {
        return Ok(None);
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            EntryToml::Text(s) => match parse_hhmm(&s) {
                Some(e) => out.push(e),
                None => {
                    return Err(serde::de::Error::custom(format!(
                        "schedule entry '{s}' is not HH:MM"
                    )));
                }
            },
            EntryToml::Table { hour, minute } => out.push(ScheduleEntry { hour, minute }),
        }
    }
    Ok(Some(out))
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Hub
        if self.hub.max_slots == 0 || self.hub.max_slots > 1_440 {
            eyre::bail!("hub.max_slots must be in 1..=1440");
        }
        if self.hub.stagger_offset_min >= 1_440 {
            eyre::bail!("hub.stagger_offset_min must be < 1440");
        }
        if self.hub.tick_ms == 0 {
            eyre::bail!("hub.tick_ms must be >= 1");
        }
        if self.hub.tick_ms > 60_000 {
            eyre::bail!("hub.tick_ms is unreasonably large (>60s)");
        }
        if !(-900..=900).contains(&self.hub.utc_offset_min) {
            eyre::bail!("hub.utc_offset_min must be in -900..=900");
        }

        // Calibration
        if self.calibration.test_ms == 0 {
            eyre::bail!("calibration.test_ms must be >= 1");
        }
        if self.calibration.prime_ms > 10 * 60 * 1000 {
            eyre::bail!("calibration.prime_ms is unreasonably large (>10min)");
        }
        if !(self.calibration.max_ml_per_sec.is_finite() && self.calibration.max_ml_per_sec > 0.0)
        {
            eyre::bail!("calibration.max_ml_per_sec must be > 0");
        }
        if !(self.calibration.min_measured_ml.is_finite() && self.calibration.min_measured_ml >= 0.0)
        {
            eyre::bail!("calibration.min_measured_ml must be >= 0");
        }

        // Logging
        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never, daily, hourly");
        }

        // Pumps
        if self.pumps.is_empty() {
            eyre::bail!("at least one [[pump]] must be configured");
        }
        let mut ids = HashSet::new();
        let mut pins = HashSet::new();
        for p in &self.pumps {
            if p.id.trim().is_empty() {
                eyre::bail!("pump.id must not be empty");
            }
            if !ids.insert(p.id.as_str()) {
                eyre::bail!("pump.id '{}' is duplicated", p.id);
            }
            if !pins.insert(p.output_pin) {
                eyre::bail!(
                    "pump '{}': output_pin {} is already used by another pump",
                    p.id,
                    p.output_pin
                );
            }
            p.validate()?;
        }
        Ok(())
    }
}

impl PumpCfg {
    pub fn validate(&self) -> eyre::Result<()> {
        let id = &self.id;
        if !(self.daily_dose_ml.is_finite() && self.daily_dose_ml > 0.0) {
            eyre::bail!("pump '{id}': daily_dose_ml must be > 0");
        }
        if !(self.calibration_ml_per_sec.is_finite() && self.calibration_ml_per_sec > 0.0) {
            eyre::bail!("pump '{id}': calibration_ml_per_sec must be > 0");
        }
        if let Some(min) = self.min_dose_ml
            && !(min.is_finite() && min > 0.0)
        {
            eyre::bail!("pump '{id}': min_dose_ml must be > 0");
        }
        if let Some(dose) = self.dose_ml
            && !(dose.is_finite() && dose > 0.0)
        {
            eyre::bail!("pump '{id}': dose_ml must be > 0");
        }
        if self.enable_pin.is_some_and(|pin| pin == self.output_pin) {
            eyre::bail!("pump '{id}': enable_pin must differ from output_pin");
        }
        match (&self.schedule, self.min_dose_ml) {
            (Some(_), Some(_)) => {
                eyre::bail!("pump '{id}': schedule and min_dose_ml are mutually exclusive")
            }
            (None, None) => {
                eyre::bail!("pump '{id}': set either schedule (explicit) or min_dose_ml (auto)")
            }
            (Some(entries), None) => {
                if entries.is_empty() {
                    eyre::bail!("pump '{id}': schedule must not be empty");
                }
                for e in entries {
                    if e.hour > 23 || e.minute > 59 {
                        eyre::bail!(
                            "pump '{id}': schedule entry {:02}:{:02} is not a valid time of day",
                            e.hour,
                            e.minute
                        );
                    }
                }
            }
            (None, Some(_)) => {
                if self.dose_ml.is_some() {
                    eyre::bail!("pump '{id}': dose_ml only applies to an explicit schedule");
                }
            }
        }
        Ok(())
    }

    pub fn is_auto(&self) -> bool {
        self.schedule.is_none()
    }
}

// ── Calibration state ────────────────────────────────────────────────────────

/// Calibration state CSV schema.
///
/// Expected headers:
/// pump_id,ml_per_sec,calibrated_at
///
/// Example:
/// pump_id,ml_per_sec,calibrated_at
/// alk,1.42,1767225600
/// cal,0.97,
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CalibrationRecord {
    pub pump_id: String,
    pub ml_per_sec: f32,
    pub calibrated_at: Option<u64>,
}

const STATE_HEADERS: [&str; 3] = ["pump_id", "ml_per_sec", "calibrated_at"];

pub fn load_calibration_state(path: &Path) -> eyre::Result<Vec<CalibrationRecord>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open calibration state {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let actual: Vec<&str> = headers.iter().collect();
    if actual != STATE_HEADERS {
        eyre::bail!(
            "calibration state CSV must have headers '{}', got: {}",
            STATE_HEADERS.join(","),
            actual.join(",")
        );
    }

    let mut rows: Vec<CalibrationRecord> = Vec::new();
    for (idx, rec) in rdr.deserialize::<CalibrationRecord>().enumerate() {
        let row = rec.map_err(|e| eyre::eyre!("invalid CSV row {}: {}", idx + 2, e))?;
        if !(row.ml_per_sec.is_finite() && row.ml_per_sec > 0.0) {
            eyre::bail!(
                "invalid CSV row {}: ml_per_sec must be > 0 for pump '{}'",
                idx + 2,
                row.pump_id
            );
        }
        if rows.iter().any(|r| r.pump_id == row.pump_id) {
            eyre::bail!("invalid CSV row {}: duplicate pump '{}'", idx + 2, row.pump_id);
        }
        rows.push(row);
    }
    Ok(rows)
}

pub fn save_calibration_state(path: &Path, records: &[CalibrationRecord]) -> eyre::Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    wtr.write_record(STATE_HEADERS)?;
    for r in records {
        wtr.serialize(r)?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| eyre::eyre!("flush calibration state: {}", e))?;
    write_atomic(path, &bytes)
        .map_err(|e| eyre::eyre!("write calibration state {:?}: {}", path, e))
}

/// Insert or replace the record for `record.pump_id`.
pub fn upsert_calibration(records: &mut Vec<CalibrationRecord>, record: CalibrationRecord) {
    match records.iter_mut().find(|r| r.pump_id == record.pump_id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

impl Config {
    /// Overlay persisted calibrations onto the configured defaults.
    /// Returns ids present in the state but not configured.
    pub fn apply_calibration_state(&mut self, records: &[CalibrationRecord]) -> Vec<String> {
        let mut unknown = Vec::new();
        for r in records {
            match self.pumps.iter_mut().find(|p| p.id == r.pump_id) {
                Some(p) => {
                    p.calibration_ml_per_sec = r.ml_per_sec;
                    p.calibrated_at = r.calibrated_at;
                }
                None => unknown.push(r.pump_id.clone()),
            }
        }
        unknown
    }
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let tmp = path.with_extension("new");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("08:30"), Some(ScheduleEntry { hour: 8, minute: 30 }));
        assert_eq!(parse_hhmm(" 7:05 "), Some(ScheduleEntry { hour: 7, minute: 5 }));
        assert_eq!(parse_hhmm("0830"), None);
        assert_eq!(parse_hhmm("aa:bb"), None);
    }

    #[test]
    fn upsert_replaces_existing() {
        let mut v = vec![CalibrationRecord {
            pump_id: "a".into(),
            ml_per_sec: 1.0,
            calibrated_at: None,
        }];
        upsert_calibration(
            &mut v,
            CalibrationRecord {
                pump_id: "a".into(),
                ml_per_sec: 2.0,
                calibrated_at: Some(5),
            },
        );
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].ml_per_sec, 2.0);
    }
}

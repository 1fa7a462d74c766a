//! Rendering of `DoseEvent`s as JSON lines or human-readable text.

use microdoser_core::DoseEvent;
use microdoser_traits::WallTime;
use serde_json::{Value, json};

/// "d<day> HH:MM:SS" for a local wall-clock reading.
pub fn clock(w: WallTime) -> String {
    format!(
        "d{} {:02}:{:02}:{:02}",
        w.day(),
        w.hour(),
        w.minute(),
        w.local_secs() % 60
    )
}

/// Structured form of an event. `now` is the hub clock when the event was
/// observed (`null` while unsynchronized).
pub fn to_json(ev: &DoseEvent, now: Option<WallTime>) -> Value {
    let mut obj = json!({
        "event": ev.name(),
        "pump": ev.pump(),
        "time": now.map(clock),
    });
    let extra = match ev {
        DoseEvent::DoseStarted {
            slot,
            volume_ml,
            duration_ms,
            minutes_late,
            ..
        } => json!({
            "slot": slot.to_string(),
            "volume_ml": volume_ml,
            "duration_ms": duration_ms,
            "minutes_late": minutes_late,
        }),
        DoseEvent::DoseCompleted {
            slot,
            volume_ml,
            at,
            ..
        } => json!({
            "slot": slot.to_string(),
            "volume_ml": volume_ml,
            "at": at,
        }),
        DoseEvent::DoseCancelled { slot, reason, .. } => {
            json!({ "slot": slot.to_string(), "reason": reason.to_string() })
        }
        DoseEvent::DoseFailed { slot, error, .. } => {
            json!({ "slot": slot.to_string(), "error": error.to_string() })
        }
        DoseEvent::DoseQueued { slot, .. } => json!({ "slot": slot.to_string() }),
        DoseEvent::DoseSkipped {
            slot, minutes_late, ..
        } => json!({ "slot": slot.to_string(), "minutes_late": minutes_late }),
        DoseEvent::FaultRaised {
            missed,
            missed_at,
            minutes_late,
            ..
        } => json!({
            "missed": missed.to_string(),
            "missed_at": missed_at,
            "minutes_late": minutes_late,
        }),
        DoseEvent::FaultCleared { .. } | DoseEvent::Enabled { .. } | DoseEvent::Disabled { .. } => {
            json!({})
        }
        DoseEvent::ManualRunStarted {
            kind, duration_ms, ..
        } => json!({ "kind": kind.as_str(), "duration_ms": duration_ms }),
        DoseEvent::ManualRunFinished { kind, .. } => json!({ "kind": kind.as_str() }),
        DoseEvent::ManualRunCancelled { kind, reason, .. } => {
            json!({ "kind": kind.as_str(), "reason": reason.to_string() })
        }
        DoseEvent::ManualRunFailed { kind, error, .. } => {
            json!({ "kind": kind.as_str(), "error": error.to_string() })
        }
        DoseEvent::CalibrationPhase { phase, .. } => json!({ "phase": phase.to_string() }),
        DoseEvent::CalibrationApplied {
            previous_ml_per_sec,
            ml_per_sec,
            ..
        } => json!({
            "previous_ml_per_sec": previous_ml_per_sec,
            "ml_per_sec": ml_per_sec,
        }),
        DoseEvent::CalibrationRejected { value, reason, .. } => {
            json!({ "value": value, "reason": reason.to_string() })
        }
    };
    if let (Some(dst), Value::Object(src)) = (obj.as_object_mut(), extra) {
        dst.extend(src);
    }
    obj
}

/// One-line operator description of an event.
pub fn to_line(ev: &DoseEvent, now: Option<WallTime>) -> String {
    let stamp = now.map_or_else(|| "unsynced".to_owned(), clock);
    let what = match ev {
        DoseEvent::DoseStarted {
            slot,
            volume_ml,
            duration_ms,
            minutes_late,
            ..
        } => {
            let late = if *minutes_late > 0 {
                format!(", {minutes_late} min late")
            } else {
                String::new()
            };
            format!("dose {slot} started: {volume_ml:.2} ml over {duration_ms} ms{late}")
        }
        DoseEvent::DoseCompleted { slot, volume_ml, .. } => {
            format!("dose {slot} complete: {volume_ml:.2} ml")
        }
        DoseEvent::DoseCancelled { slot, reason, .. } => format!("dose {slot} cancelled ({reason})"),
        DoseEvent::DoseFailed { slot, error, .. } => format!("dose {slot} failed: {error}"),
        DoseEvent::DoseQueued { slot, .. } => format!("dose {slot} queued behind another pump"),
        DoseEvent::DoseSkipped {
            slot, minutes_late, ..
        } => format!("dose {slot} skipped, {minutes_late} min late"),
        DoseEvent::FaultRaised {
            missed,
            minutes_late,
            ..
        } => format!("FAULT: dose {missed} missed by {minutes_late} min"),
        DoseEvent::FaultCleared { .. } => "fault cleared".to_owned(),
        DoseEvent::Enabled { .. } => "enabled".to_owned(),
        DoseEvent::Disabled { .. } => "disabled".to_owned(),
        DoseEvent::ManualRunStarted {
            kind, duration_ms, ..
        } => format!("{kind} started for {duration_ms} ms"),
        DoseEvent::ManualRunFinished { kind, .. } => format!("{kind} finished"),
        DoseEvent::ManualRunCancelled { kind, reason, .. } => {
            format!("{kind} cancelled ({reason})")
        }
        DoseEvent::ManualRunFailed { kind, error, .. } => format!("{kind} failed: {error}"),
        DoseEvent::CalibrationPhase { phase, .. } => format!("calibration phase: {phase}"),
        DoseEvent::CalibrationApplied {
            previous_ml_per_sec,
            ml_per_sec,
            ..
        } => format!("calibration applied: {previous_ml_per_sec:.3} -> {ml_per_sec:.3} ml/s"),
        DoseEvent::CalibrationRejected { value, reason, .. } => {
            format!("calibration result {value} rejected: {reason}")
        }
    };
    format!("[{stamp}] {}: {what}", ev.pump())
}

/// Prints events to stdout in the selected format.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    pub json: bool,
}

impl Printer {
    pub fn emit(&self, ev: &DoseEvent, now: Option<WallTime>) {
        if self.json {
            println!("{}", to_json(ev, now));
        } else {
            println!("{}", to_line(ev, now));
        }
    }
}

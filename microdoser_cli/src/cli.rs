//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "microdoser", version, about = "Scheduled liquid dosing controller")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/microdoser.toml")]
    pub config: PathBuf,

    /// Print events and errors as JSON lines
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); overrides [logging].level
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the dosing hub against the system clock until Ctrl-C
    Run {
        /// Stop after this many ticks
        #[arg(long, value_name = "N")]
        max_ticks: Option<u64>,
    },
    /// Replay the configured schedule on a simulated clock
    Simulate {
        /// Simulated local start time
        #[arg(long, value_name = "HH:MM", default_value = "00:00", value_parser = parse_hhmm)]
        start: (u8, u8),
        /// Simulated span in hours
        #[arg(long, value_name = "H", default_value_t = 24)]
        hours: u32,
        /// Tick period in ms (default: [hub].tick_ms)
        #[arg(long, value_name = "MS")]
        tick_ms: Option<u64>,
        /// Make this pump's output refuse to turn on (repeatable)
        #[arg(long = "fail-pump", value_name = "ID")]
        fail_pumps: Vec<String>,
        /// Start with this pump disabled (repeatable)
        #[arg(long = "disable", value_name = "ID")]
        disabled: Vec<String>,
    },
    /// Print the resolved schedule of every pump
    Schedule,
    /// Run one pump for the configured priming time
    Prime {
        /// Pump id
        #[arg(long, value_name = "ID")]
        pump: String,
    },
    /// Prime, run the timed test and apply the measured volume
    Calibrate {
        /// Pump id
        #[arg(long, value_name = "ID")]
        pump: String,
        /// Measured test volume in ml; prompts on stdin when omitted
        #[arg(long, value_name = "ML")]
        measured_ml: Option<f32>,
    },
    /// Quick health check (config, outputs, clock)
    SelfCheck,
}

/// Parse "HH:MM" into hour and minute.
pub fn parse_hhmm(s: &str) -> Result<(u8, u8), String> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| format!("expected HH:MM, got '{s}'"))?;
    let hour: u8 = h.parse().map_err(|_| format!("invalid hour in '{s}'"))?;
    let minute: u8 = m.parse().map_err(|_| format!("invalid minute in '{s}'"))?;
    if hour > 23 || minute > 59 {
        return Err(format!("'{s}' is not a valid time of day"));
    }
    Ok((hour, minute))
}

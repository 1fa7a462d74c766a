#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core dosing logic (hardware-agnostic).
//!
//! All hardware interaction goes through `microdoser_traits::Output`,
//! `EnableInput` and `TimeSource`.
//!
//! ## Architecture
//!
//! - **Schedule**: time-of-day slots and synthesis of staggered daily schedules (`schedule`)
//! - **Calibration**: flow-rate profile, volume ↔ duration (`calibration`)
//! - **Pump**: per-pump dose state machine with non-blocking deadlines (`pump`)
//! - **Watchdog**: missed-dose escalation to a sticky fault (`watchdog`)
//! - **Hub**: pump registry, tick dispatch and calibration workflow (`hub`, `session`)
//! - **Runner**: cooperative tick loop with shutdown flag (`runner`)
//!
//! ## Example
//!
//! ```
//! use microdoser_core::{DosingHub, PumpSpec, ScheduleMode, Tick, TickTime};
//! use microdoser_core::mocks::NoopOutput;
//! use microdoser_traits::{ManualTimeSource, WallTime};
//!
//! let time = ManualTimeSource::at(WallTime::from_day_hms(0, 7, 59, 0));
//! let mut hub = DosingHub::builder()
//!     .with_time_source(time)
//!     .add_pump(PumpSpec::new(
//!         "alk",
//!         100.0,
//!         ScheduleMode::Auto { min_dose_ml: 10.0 },
//!         1.0,
//!         NoopOutput,
//!     ))
//!     .build()
//!     .unwrap();
//! assert_eq!(hub.pump("alk").unwrap().schedule().len(), 10);
//! let _events = hub.poll();
//! ```

pub mod builder;
pub mod calibration;
pub mod config;
pub mod conversions;
pub mod error;
pub mod hub;
pub mod hw_error;
pub mod mocks;
pub mod pump;
pub mod runner;
pub mod schedule;
pub mod session;
pub mod status;
pub mod util;
pub mod watchdog;

pub use builder::{HubBuilder, PumpSpec};
pub use calibration::CalibrationProfile;
pub use config::{CalibrationCfg, SchedulerCfg};
pub use error::{BuildError, CalibrationError, DoserError, RejectReason, Result};
pub use hub::DosingHub;
pub use pump::{PumpController, StartGate};
pub use schedule::{DoseSchedule, Occurrence, ScheduleMode, TimeOfDay, synthesize};
pub use session::{CalibrationPhase, CalibrationSession};
pub use status::{CancelReason, DoseEvent, ManualRunKind, PumpState, Tick, TickTime};
pub use watchdog::{WatchdogMode, WatchdogMonitor, WatchdogRecord};

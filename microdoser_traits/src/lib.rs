//! Collaborator seams for the dosing core: time, outputs and enable inputs.

pub mod clock;

pub use clock::{ManualTimeSource, SystemTimeSource, TimeSource, WallTime};

/// Binary pump output (relay, MOSFET, expander pin).
///
/// The core treats outputs as fire-and-forget: a successful return does not
/// mean the pump physically started or stopped.
pub trait Output {
    fn turn_on(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn turn_off(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl<O: Output + ?Sized> Output for Box<O> {
    fn turn_on(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).turn_on()
    }
    fn turn_off(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).turn_off()
    }
}

/// Optional per-pump enable signal (switch entity, GPIO input).
pub trait EnableInput {
    fn is_enabled(&self) -> bool;
}

impl<F: Fn() -> bool> EnableInput for F {
    fn is_enabled(&self) -> bool {
        self()
    }
}

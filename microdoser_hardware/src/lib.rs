#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
//! Output and enable-input backends for pump controllers.
//!
//! The simulated backend is always available; the `hardware` feature adds
//! rppal GPIO pins on Linux.

pub mod error;
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod gpio;

use microdoser_traits::{EnableInput, Output};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::HwError;

/// Simulated pump output.
///
/// Clones share state, so a caller can keep a handle to observe the pump
/// while the controller owns the output.
#[derive(Debug, Clone, Default)]
pub struct SimulatedOutput {
    label: Arc<str>,
    on: Arc<AtomicBool>,
    activations: Arc<AtomicU32>,
    fail_on: Arc<AtomicBool>,
}

impl SimulatedOutput {
    pub fn new(label: impl Into<Arc<str>>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Whether the output is currently asserted.
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }

    /// Number of off→on edges seen so far.
    pub fn activations(&self) -> u32 {
        self.activations.load(Ordering::Relaxed)
    }

    /// Make subsequent `turn_on` calls fail (stuck driver, missing expander).
    pub fn set_fail_on(&self, fail: bool) {
        self.fail_on.store(fail, Ordering::Relaxed);
    }
}

impl Output for SimulatedOutput {
    fn turn_on(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.fail_on.load(Ordering::Relaxed) {
            return Err(Box::new(HwError::Simulated(format!(
                "{} refused to turn on",
                self.label
            ))));
        }
        if !self.on.swap(true, Ordering::Relaxed) {
            self.activations.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(output = %self.label, "output on (simulated)");
        Ok(())
    }

    fn turn_off(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.on.store(false, Ordering::Relaxed);
        tracing::debug!(output = %self.label, "output off (simulated)");
        Ok(())
    }
}

/// Enable input backed by a shared flag; stands in for a switch entity.
#[derive(Debug, Clone)]
pub struct SwitchInput {
    enabled: Arc<AtomicBool>,
}

impl SwitchInput {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

impl EnableInput for SwitchInput {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

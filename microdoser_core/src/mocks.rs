//! Test doubles for microdoser_core.

use std::sync::{Arc, Mutex};

use microdoser_traits::Output;

/// Output edge recorded by [`SpyOutput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    On,
    Off,
}

#[derive(Debug, Default)]
struct SpyState {
    on: bool,
    history: Vec<Edge>,
    fail_on: bool,
    fail_off: bool,
}

/// Output that records every call. Clones share state.
///
/// A failed `turn_on` leaves the output de-asserted. A failed `turn_off`
/// still de-asserts it (the call is recorded) but reports an error, which
/// lets tests exercise the logging path.
#[derive(Debug, Clone, Default)]
pub struct SpyOutput {
    state: Arc<Mutex<SpyState>>,
}

impl SpyOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut SpyState) -> R) -> R {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn is_on(&self) -> bool {
        self.with(|s| s.on)
    }

    pub fn history(&self) -> Vec<Edge> {
        self.with(|s| s.history.clone())
    }

    /// Number of `turn_on` calls that succeeded.
    pub fn on_count(&self) -> usize {
        self.with(|s| s.history.iter().filter(|e| **e == Edge::On).count())
    }

    pub fn set_fail_on(&self, fail: bool) {
        self.with(|s| s.fail_on = fail);
    }

    pub fn set_fail_off(&self, fail: bool) {
        self.with(|s| s.fail_off = fail);
    }
}

impl Output for SpyOutput {
    fn turn_on(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.with(|s| {
            if s.fail_on {
                return Err(std::io::Error::other("spy output refused turn_on").into());
            }
            s.on = true;
            s.history.push(Edge::On);
            Ok(())
        })
    }

    fn turn_off(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.with(|s| {
            s.on = false;
            s.history.push(Edge::Off);
            if s.fail_off {
                return Err(std::io::Error::other("spy output refused turn_off").into());
            }
            Ok(())
        })
    }
}

/// Output that accepts every call and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOutput;

impl Output for NoopOutput {
    fn turn_on(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    fn turn_off(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

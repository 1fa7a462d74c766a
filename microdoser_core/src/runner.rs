//! Cooperative tick loop driving a `DosingHub`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::hub::DosingHub;
use crate::status::DoseEvent;
use crate::util::duration_ms;

/// Loop pacing.
#[derive(Debug, Clone, Copy)]
pub struct RunParams {
    /// Upper bound on the time between ticks.
    pub tick: Duration,
    /// Stop after this many ticks (`None` runs until shutdown).
    pub max_ticks: Option<u64>,
    /// Stop once this much monotonic time has passed on the hub's time source.
    pub run_for: Option<Duration>,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            max_ticks: None,
            run_for: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub ticks: u64,
    pub events: u64,
    pub doses_completed: u64,
    pub faults: u64,
}

impl RunStats {
    fn record(&mut self, event: &DoseEvent) {
        self.events += 1;
        match event {
            DoseEvent::DoseCompleted { .. } => self.doses_completed += 1,
            DoseEvent::FaultRaised { .. } => self.faults += 1,
            _ => {}
        }
    }
}

/// Time to sleep before the next tick: the tick period, shortened so a pending
/// output deadline is not overrun.
#[inline]
fn next_sleep(tick: Duration, now_ms: u64, deadline_ms: Option<u64>) -> Duration {
    match deadline_ms {
        Some(d) if d > now_ms => tick.min(Duration::from_millis(d - now_ms)),
        Some(_) => Duration::ZERO,
        None => tick,
    }
}

/// Tick the hub until `shutdown` is set or `max_ticks` is reached, then stop
/// all outputs. Every event is passed to `on_event`.
pub fn run<F>(
    hub: &mut DosingHub,
    params: &RunParams,
    shutdown: &AtomicBool,
    mut on_event: F,
) -> RunStats
where
    F: FnMut(&DoseEvent),
{
    let mut stats = RunStats::default();
    let start_ms = hub.time_source().monotonic_ms();
    let stop_ms = params
        .run_for
        .map(|d| start_ms.saturating_add(duration_ms(d)));
    tracing::info!(
        tick_ms = params.tick.as_millis() as u64,
        max_ticks = ?params.max_ticks,
        run_for_ms = ?stop_ms.map(|s| s - start_ms),
        "tick loop start"
    );

    while !shutdown.load(Ordering::Relaxed)
        && params.max_ticks.is_none_or(|max| stats.ticks < max)
        && stop_ms.is_none_or(|stop| hub.time_source().monotonic_ms() < stop)
    {
        for event in hub.poll() {
            stats.record(&event);
            on_event(&event);
        }
        stats.ticks += 1;

        let now_ms = hub.time_source().monotonic_ms();
        let deadline = match (hub.next_deadline_ms(), stop_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let sleep = next_sleep(params.tick, now_ms, deadline);
        if !sleep.is_zero() {
            hub.time_source().sleep(sleep);
        }
    }

    for event in hub.shutdown() {
        stats.record(&event);
        on_event(&event);
    }
    tracing::info!(
        ticks = stats.ticks,
        events = stats.events,
        doses = stats.doses_completed,
        faults = stats.faults,
        "tick loop stopped"
    );
    stats
}

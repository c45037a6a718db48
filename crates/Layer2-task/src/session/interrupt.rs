//! Interrupt escalation
//!
//! Ctrl-C pressed inside an agent session normally belongs to the agent.
//! Pressing it repeatedly within a short window escalates to aborting the
//! whole workflow.

use conduit_foundation::InterruptSettings;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// The interrupt byte (Ctrl-C) as read from a raw-mode terminal
pub const INTERRUPT_BYTE: u8 = 0x03;

/// What to do with one interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Pass the interrupt through to the child
    Forward,
    /// Cancel the workflow run
    Abort,
}

#[derive(Debug, Default)]
struct Counter {
    count: u32,
    last_seen: Option<Instant>,
}

/// Counts consecutive interrupts inside a sliding window
#[derive(Debug)]
pub struct InterruptEscalator {
    window: Duration,
    threshold: u32,
    counter: Mutex<Counter>,
}

impl InterruptEscalator {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            counter: Mutex::new(Counter::default()),
        }
    }

    pub fn from_settings(settings: &InterruptSettings) -> Self {
        Self::new(settings.window(), settings.abort_threshold)
    }

    /// Register an interrupt seen now
    pub fn register(&self) -> InterruptAction {
        self.register_at(Instant::now())
    }

    /// Register an interrupt seen at `now`
    pub fn register_at(&self, now: Instant) -> InterruptAction {
        let mut counter = self.counter.lock();

        if let Some(last) = counter.last_seen {
            if now.saturating_duration_since(last) > self.window {
                counter.count = 0;
            }
        }
        counter.count += 1;
        counter.last_seen = Some(now);

        if counter.count >= self.threshold {
            info!(count = counter.count, "interrupt threshold reached, aborting workflow");
            counter.count = 0;
            counter.last_seen = None;
            InterruptAction::Abort
        } else {
            debug!(count = counter.count, "forwarding interrupt to agent");
            InterruptAction::Forward
        }
    }

    /// Current consecutive count
    pub fn count(&self) -> u32 {
        self.counter.lock().count
    }

    pub fn reset(&self) {
        *self.counter.lock() = Counter::default();
    }
}

impl Default for InterruptEscalator {
    fn default() -> Self {
        Self::from_settings(&InterruptSettings::default())
    }
}

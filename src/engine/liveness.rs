//! Liveness monitor
//!
//! MIDI has no connection state, so silence is the only disconnect signal.
//! The monitor is evaluated on a fixed tick: after a short silence it asks
//! for a heartbeat, after a long one it declares the device gone.

use std::time::{Duration, Instant};

/// Timing of the liveness checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessTiming {
    pub tick: Duration,
    /// Quiet period after a connect before any verdict
    pub grace: Duration,
    /// Silence (in ticks) after which a probe is sent
    pub probe_after_ticks: u32,
    /// Silence (in ticks) after which the device is considered gone
    pub disconnect_after_ticks: u32,
}

impl Default for LivenessTiming {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(317),
            grace: Duration::from_millis(2000),
            probe_after_ticks: 2,
            disconnect_after_ticks: 4,
        }
    }
}

/// What the engine should do on this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Quiet,
    /// Send a version probe
    Probe,
    /// Mark disconnected and rediscover ports
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    timing: LivenessTiming,
    armed_at: Instant,
    last_heard: Instant,
}

impl LivenessMonitor {
    pub fn new(timing: LivenessTiming, now: Instant) -> Self {
        Self {
            timing,
            armed_at: now + timing.grace,
            last_heard: now,
        }
    }

    pub fn timing(&self) -> LivenessTiming {
        self.timing
    }

    pub fn set_timing(&mut self, timing: LivenessTiming) {
        self.timing = timing;
    }

    /// A primary output was bound: restart the grace period
    pub fn on_connected(&mut self, now: Instant) {
        self.armed_at = now + self.timing.grace;
        self.last_heard = now;
    }

    /// Any frame from the device
    pub fn on_message(&mut self, now: Instant) {
        self.last_heard = now;
    }

    /// A rediscovery ran; measure the next silence from here
    pub fn on_rediscover(&mut self, now: Instant) {
        self.last_heard = now;
    }

    /// Evaluate the silence so far
    pub fn check(&self, now: Instant, connected: bool) -> Verdict {
        if now < self.armed_at {
            return Verdict::Quiet;
        }

        let silence = now.saturating_duration_since(self.last_heard);
        if silence > self.timing.tick * self.timing.disconnect_after_ticks {
            Verdict::Disconnect
        } else if connected && silence > self.timing.tick * self.timing.probe_after_ticks {
            Verdict::Probe
        } else {
            Verdict::Quiet
        }
    }
}

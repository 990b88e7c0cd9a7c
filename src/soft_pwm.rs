//! Software time-proportional PWM.
//!
//! Mechanical relays cannot switch at hardware PWM rates, so the duty cycle
//! is spread over a long period (1 s by default) as one ON phase and one OFF
//! phase. The scheduler is deadline-based: the owner sleeps until
//! [`SoftPwm::next_deadline_ms`] and then calls [`SoftPwm::service`], which
//! returns the edge to dispatch. Forced states reschedule from "now" so a
//! stale sleep can never replay an old edge.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmEdge {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    On,
    Off,
}

pub const DEFAULT_PERIOD_MS: u32 = 1000;

/// Zero-length phases still get their edge; the floor keeps duty 0 or 1
/// from spinning the scheduler.
const MIN_EDGE_DELAY_MS: u64 = 1;

#[derive(Debug)]
pub struct SoftPwm {
    period_ms: u32,
    duty_cycle: f64,
    on_ms: u32,
    off_ms: u32,
    phase: Phase,
    running: bool,
    next_edge_at_ms: Option<u64>,
}

impl SoftPwm {
    pub fn new(period_ms: u32, duty_cycle: f64) -> Self {
        let mut pwm = Self {
            period_ms: period_ms.max(1),
            duty_cycle: duty_cycle.clamp(0.0, 1.0),
            on_ms: 0,
            off_ms: 0,
            phase: Phase::Off,
            running: false,
            next_edge_at_ms: None,
        };
        pwm.recompute_durations();
        pwm
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn period_ms(&self) -> u32 {
        self.period_ms
    }

    pub fn duty_cycle(&self) -> f64 {
        self.duty_cycle
    }

    /// Takes effect at the next edge.
    pub fn set_period_ms(&mut self, period_ms: u32) {
        self.period_ms = period_ms.max(1);
        self.recompute_durations();
    }

    /// Clamped to [0, 1]; takes effect at the next edge.
    pub fn set_duty_cycle(&mut self, duty_cycle: f64) {
        self.duty_cycle = duty_cycle.clamp(0.0, 1.0);
        self.recompute_durations();
    }

    /// Begin in the OFF phase and schedule the first edge.
    pub fn start(&mut self, now_ms: u64) {
        if self.running {
            return;
        }
        self.phase = Phase::Off;
        self.running = true;
        self.schedule_next_edge(now_ms);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.next_edge_at_ms = None;
    }

    /// Synchronously enter the ON phase. Returns the edge to dispatch if the
    /// phase actually changed; any pending edge is rescheduled from `now_ms`.
    pub fn force_on(&mut self, now_ms: u64) -> Option<PwmEdge> {
        let edge = if self.phase != Phase::On {
            self.phase = Phase::On;
            Some(PwmEdge::On)
        } else {
            None
        };
        if self.running {
            self.schedule_next_edge(now_ms);
        }
        edge
    }

    /// Synchronously enter the OFF phase; see [`SoftPwm::force_on`].
    pub fn force_off(&mut self, now_ms: u64) -> Option<PwmEdge> {
        let edge = if self.phase != Phase::Off {
            self.phase = Phase::Off;
            Some(PwmEdge::Off)
        } else {
            None
        };
        if self.running {
            self.schedule_next_edge(now_ms);
        }
        edge
    }

    /// Absolute deadline of the next edge; `None` while stopped.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.next_edge_at_ms
    }

    /// Toggle the phase if the deadline has passed and return the edge to
    /// dispatch. A wakeup before the deadline is a no-op.
    pub fn service(&mut self, now_ms: u64) -> Option<PwmEdge> {
        if !self.running {
            return None;
        }
        let deadline = self.next_edge_at_ms?;
        if now_ms < deadline {
            return None;
        }

        let edge = match self.phase {
            Phase::Off => {
                self.phase = Phase::On;
                PwmEdge::On
            }
            Phase::On => {
                self.phase = Phase::Off;
                PwmEdge::Off
            }
        };
        self.schedule_next_edge(now_ms);
        Some(edge)
    }

    fn recompute_durations(&mut self) {
        let on = (f64::from(self.period_ms) * self.duty_cycle + 0.5) as u32;
        let on = on.min(self.period_ms);
        self.on_ms = on;
        self.off_ms = self.period_ms - on;
    }

    fn schedule_next_edge(&mut self, now_ms: u64) {
        let duration = match self.phase {
            Phase::On => u64::from(self.on_ms),
            Phase::Off => u64::from(self.off_ms),
        };
        self.next_edge_at_ms = Some(now_ms + duration.max(MIN_EDGE_DELAY_MS));
    }
}

impl Default for SoftPwm {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD_MS, 0.0)
    }
}

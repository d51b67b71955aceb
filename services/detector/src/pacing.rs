//! Adaptive frame skipping.
//!
//! Each lot worker keeps a rolling average of its processing cycle time. When
//! the average runs over the per-cycle budget the worker discards more frames
//! between processed ones. Under budget it discards fewer: one step per cycle
//! when the average is below `recovery_ratio * budget`, one step per full
//! window otherwise. The skip factor stays within `0..=max_skip` and always
//! drains back to 0 while the average stays under budget.

use std::collections::VecDeque;
use std::time::Duration;

/// Fixed-size moving average of cycle durations.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    window: usize,
    samples: VecDeque<Duration>,
    total: Duration,
}

impl RollingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            total: Duration::ZERO,
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.total = self.total.saturating_sub(oldest);
            }
        }
        self.samples.push_back(sample);
        self.total += sample;
    }

    /// Average over the retained samples, `None` before the first sample.
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.total / self.samples.len() as u32)
        }
    }

}

/// Skip-factor controller driven by the rolling cycle time.
#[derive(Debug, Clone)]
pub struct AdaptiveSkip {
    budget: Duration,
    max_skip: u32,
    recovery_ratio: f64,
    window: u32,
    skip: u32,
    calm_cycles: u32,
    average: RollingAverage,
}

impl AdaptiveSkip {
    pub fn new(budget: Duration, max_skip: u32, window: usize, recovery_ratio: f64) -> Self {
        Self {
            budget,
            max_skip,
            recovery_ratio: recovery_ratio.clamp(f64::EPSILON, 1.0),
            window: window.max(1) as u32,
            skip: 0,
            calm_cycles: 0,
            average: RollingAverage::new(window),
        }
    }

    /// Frames to discard before the next processed frame.
    pub fn skip_factor(&self) -> u32 {
        self.skip
    }

    pub fn average(&self) -> Option<Duration> {
        self.average.average()
    }

    /// Record one cycle and return the updated skip factor.
    pub fn record(&mut self, cycle: Duration) -> u32 {
        self.average.push(cycle);
        let Some(average) = self.average.average() else {
            return self.skip;
        };

        if average > self.budget {
            self.calm_cycles = 0;
            self.skip = (self.skip + 1).min(self.max_skip);
        } else if average < self.budget.mul_f64(self.recovery_ratio) {
            self.calm_cycles = 0;
            self.skip = self.skip.saturating_sub(1);
        } else {
            // Within budget but with little headroom: recover slowly
            self.calm_cycles += 1;
            if self.calm_cycles >= self.window {
                self.calm_cycles = 0;
                self.skip = self.skip.saturating_sub(1);
            }
        }
        self.skip
    }
}

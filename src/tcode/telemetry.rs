// src/tcode/telemetry.rs

//! Tick timing for the control loop's periodic debug line.
//!
//! Timings are accumulated per logging window and reset when summarized.
//! Write failures count for the whole run, since the loop also uses the
//! running total to throttle its error log.

use std::time::Duration;

/// One logging window of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickSummary {
    pub ticks: u32,
    pub avg_us: u64,
    pub max_us: u64,
    /// Ticks whose work took longer than the tick interval.
    pub overruns: u32,
    pub write_errors: u64,
}

#[derive(Debug, Default)]
pub struct TickTelemetry {
    ticks: u32,
    total: Duration,
    max: Duration,
    overruns: u32,
    write_errors: u64,
}

impl TickTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records how long the work part of a tick took against its budget.
    pub fn record(&mut self, duration: Duration, budget: Duration) {
        self.ticks = self.ticks.saturating_add(1);
        self.total += duration;
        self.max = self.max.max(duration);
        if duration > budget {
            self.overruns = self.overruns.saturating_add(1);
        }
    }

    /// Counts a failed transport write and returns the running total.
    pub fn record_write_error(&mut self) -> u64 {
        self.write_errors += 1;
        self.write_errors
    }

    /// Summarizes the current window and starts a new one.
    pub fn take_summary(&mut self) -> TickSummary {
        let avg = match self.ticks {
            0 => Duration::ZERO,
            n => self.total / n,
        };
        let summary = TickSummary {
            ticks: self.ticks,
            avg_us: avg.as_micros() as u64,
            max_us: self.max.as_micros() as u64,
            overruns: self.overruns,
            write_errors: self.write_errors,
        };
        *self = Self {
            write_errors: self.write_errors,
            ..Self::default()
        };
        summary
    }
}

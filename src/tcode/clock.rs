// src/tcode/clock.rs

//! Lock-free clock handoff between the video player and the control loop
//!
//! The video side publishes its current time and playback speed whenever it
//! likes; the control loop reads them once per tick. A sequence counter keeps
//! each reading consistent: time, speed and publish instant always come from
//! the same publish. Readers retry instead of waiting, and concurrent writers
//! only ever wait for each other.

use atomic_float::AtomicF64;
use std::hint;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::time::Instant;

/// One sample of the external clock, extrapolated to the moment it was read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockReading {
    pub time_ms: f64,
    pub speed: f64,
}

#[derive(Debug)]
pub struct ClockHandoff {
    epoch: Instant,
    /// Odd while a publish is in progress.
    sequence: AtomicU64,
    external_time_ms: AtomicF64,
    speed: AtomicF64,
    published_at_ns: AtomicU64,
}

impl Default for ClockHandoff {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockHandoff {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            sequence: AtomicU64::new(0),
            external_time_ms: AtomicF64::new(0.0),
            speed: AtomicF64::new(1.0),
            published_at_ns: AtomicU64::new(0),
        }
    }

    /// Publishes the external time as of now.
    pub fn publish(&self, time_ms: f64, speed: f64) {
        self.publish_at(time_ms, speed, Instant::now());
    }

    /// Publishes the external time as observed at `now`.
    ///
    /// Non-finite times are ignored; negative or non-finite speeds are
    /// stored as 0 (paused).
    pub fn publish_at(&self, time_ms: f64, speed: f64, now: Instant) {
        if !time_ms.is_finite() {
            return;
        }
        let speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };
        let published_at = self.nanos_since_epoch(now);

        let sequence = self.begin_write();
        self.external_time_ms.store(time_ms, Ordering::Relaxed);
        self.speed.store(speed, Ordering::Relaxed);
        self.published_at_ns.store(published_at, Ordering::Relaxed);
        self.sequence.store(sequence + 2, Ordering::Release);
    }

    /// Keeps the published speed but moves the time.
    pub fn publish_time(&self, time_ms: f64) {
        self.publish(time_ms, self.speed());
    }

    /// Reads the clock, extrapolated to now.
    pub fn read(&self) -> ClockReading {
        self.read_at(Instant::now())
    }

    /// Reads the clock, extrapolated by wall time elapsed since the last publish.
    pub fn read_at(&self, now: Instant) -> ClockReading {
        loop {
            if let Some(reading) = self.try_read_at(now) {
                return reading;
            }
            hint::spin_loop();
        }
    }

    pub fn speed(&self) -> f64 {
        self.read_at(Instant::now()).speed
    }

    /// Marks a publish as in progress and returns the even sequence it started from.
    fn begin_write(&self) -> u64 {
        let mut current = self.sequence.load(Ordering::Relaxed);
        loop {
            if current & 1 == 1 {
                hint::spin_loop();
                current = self.sequence.load(Ordering::Relaxed);
                continue;
            }
            match self.sequence.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // Value stores must not move above the odd sequence
        fence(Ordering::Release);
        current
    }

    /// One read attempt; `None` if a publish overlapped it.
    fn try_read_at(&self, now: Instant) -> Option<ClockReading> {
        let before = self.sequence.load(Ordering::Acquire);
        if before & 1 == 1 {
            return None;
        }
        let time_ms = self.external_time_ms.load(Ordering::Relaxed);
        let speed = self.speed.load(Ordering::Relaxed);
        let published_at = self.published_at_ns.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if self.sequence.load(Ordering::Relaxed) != before {
            return None;
        }

        let since_publish_ms =
            self.nanos_since_epoch(now).saturating_sub(published_at) as f64 / 1_000_000.0;
        Some(ClockReading {
            time_ms: time_ms + since_publish_ms * speed,
            speed,
        })
    }

    fn nanos_since_epoch(&self, instant: Instant) -> u64 {
        instant
            .saturating_duration_since(self.epoch)
            .as_nanos()
            .min(u64::MAX as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reading_is_extrapolated_by_speed() {
        let clock = ClockHandoff::new();
        let t0 = Instant::now();
        clock.publish_at(10_000.0, 1.0, t0);
        let reading = clock.read_at(t0 + Duration::from_millis(250));
        assert!((reading.time_ms - 10_250.0).abs() < 1e-6);

        clock.publish_at(10_000.0, 2.0, t0);
        let reading = clock.read_at(t0 + Duration::from_millis(250));
        assert!((reading.time_ms - 10_500.0).abs() < 1e-6);
        assert_eq!(reading.speed, 2.0);
    }

    #[test]
    fn paused_clock_does_not_move() {
        let clock = ClockHandoff::new();
        let t0 = Instant::now();
        clock.publish_at(42.0, 0.0, t0);
        assert_eq!(clock.read_at(t0 + Duration::from_secs(3)).time_ms, 42.0);
    }

    #[test]
    fn invalid_samples_are_sanitized() {
        let clock = ClockHandoff::new();
        let t0 = Instant::now();
        clock.publish_at(100.0, -1.0, t0);
        assert_eq!(clock.speed(), 0.0);
        clock.publish_at(f64::NAN, 1.0, t0);
        assert_eq!(clock.read_at(t0).time_ms, 100.0);
    }

    #[test]
    fn publish_time_keeps_speed() {
        let clock = ClockHandoff::new();
        clock.publish(0.0, 1.5);
        clock.publish_time(500.0);
        assert_eq!(clock.speed(), 1.5);
    }

    #[test]
    fn read_retries_while_a_publish_is_in_progress() {
        let clock = ClockHandoff::new();
        let t0 = Instant::now();
        clock.publish_at(1_000.0, 1.0, t0);
        assert!(clock.try_read_at(t0).is_some());

        let sequence = clock.begin_write();
        clock.external_time_ms.store(9_000.0, Ordering::Relaxed);
        assert_eq!(clock.try_read_at(t0), None);

        clock.sequence.store(sequence + 2, Ordering::Release);
        assert_eq!(clock.try_read_at(t0).map(|r| r.time_ms), Some(9_000.0));
    }

    #[test]
    fn readings_never_mix_two_publishes() {
        // Every publish describes the same timeline, so any consistent
        // reading at `now` lands on the same value
        let clock = Arc::new(ClockHandoff::new());
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(10);
        let writer = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                for i in 0..20_000u64 {
                    let k = i % 100;
                    clock.publish_at(k as f64 * 100.0, 1.0, t0 + Duration::from_millis(k * 100));
                }
            })
        };
        clock.publish_at(0.0, 1.0, t0);
        for _ in 0..20_000 {
            let reading = clock.read_at(now);
            assert!((reading.time_ms - 10_000.0).abs() < 1e-6, "torn reading {:?}", reading);
        }
        writer.join().unwrap();
    }

    #[test]
    fn concurrent_publish_and_read_never_block() {
        let clock = Arc::new(ClockHandoff::new());
        let writer = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                for i in 0..10_000 {
                    clock.publish(i as f64, 1.0);
                }
            })
        };
        for _ in 0..10_000 {
            let reading = clock.read();
            assert!(reading.time_ms.is_finite());
        }
        writer.join().unwrap();
        assert!(clock.read().time_ms >= 9_999.0);
    }
}

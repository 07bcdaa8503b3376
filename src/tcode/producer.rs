// src/tcode/producer.rs

//! Per-channel position producers
//!
//! A [`ChannelProducer`] follows one bound [`Track`] through play time. It
//! keeps a cursor on the current keyframe segment, advances it incrementally
//! on every tick, and can jump anywhere with [`ChannelProducer::sync`] after a
//! seek. Sudden jumps in the interpolated signal are blended out over at most
//! [`MAX_SMOOTHING_MS`].

use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

use super::channel::{ChannelId, Easing};
use super::funscript_utils::{self, Track};

/// Interpolated speed (position units per millisecond) above which the signal
/// is considered discontinuous.
pub const DISCONTINUITY_SPEED: f32 = 2.0;
/// Longest a discontinuity blend may last.
pub const MAX_SMOOTHING_MS: f64 = 1000.0;

/// How a channel picks its track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "track")]
pub enum TrackBinding {
    /// Unbound; eligible for automatic assignment by track name.
    #[default]
    Auto,
    /// Explicitly unbound by the user; never auto-assigned.
    Disabled,
    /// Bound to the track at this index of the current track list.
    Track(usize),
}

impl TrackBinding {
    pub const AUTO_INDEX: i64 = -1;
    pub const DISABLED_INDEX: i64 = -2;

    /// Decodes the sentinel encoding used by the configuration surface.
    pub fn from_index(index: i64) -> Self {
        match index {
            Self::DISABLED_INDEX => TrackBinding::Disabled,
            i if i >= 0 => TrackBinding::Track(i as usize),
            _ => TrackBinding::Auto,
        }
    }

    pub fn as_index(self) -> i64 {
        match self {
            TrackBinding::Auto => Self::AUTO_INDEX,
            TrackBinding::Disabled => Self::DISABLED_INDEX,
            TrackBinding::Track(i) => i as i64,
        }
    }
}

/// Interpolation policy for one tick.
///
/// Passed by value into every tick so a configuration change can never be
/// observed halfway through one.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TickPolicy {
    pub easing: Easing,
    pub spline: bool,
    pub remap_to_full_range: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Smoothing {
    Idle,
    Active {
        target: f32,
        start_value: f32,
        start_time: f64,
    },
}

#[derive(Debug, Clone)]
pub struct ChannelProducer {
    channel: ChannelId,
    binding: TrackBinding,
    assigned_automatically: bool,
    track: Weak<Track>,
    cursor: usize,
    script_range: Option<(i32, i32)>,
    last_interpolated: Option<f32>,
    last_tick_ms: Option<f64>,
    smoothing: Smoothing,
    needs_resync: bool,
}

impl ChannelProducer {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            binding: TrackBinding::Auto,
            assigned_automatically: false,
            track: Weak::new(),
            cursor: 0,
            script_range: None,
            last_interpolated: None,
            last_tick_ms: None,
            smoothing: Smoothing::Idle,
            needs_resync: false,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn binding(&self) -> TrackBinding {
        self.binding
    }

    pub fn is_auto_assigned(&self) -> bool {
        self.assigned_automatically
    }

    /// Index of the keyframe ending the current segment.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_smoothing(&self) -> bool {
        matches!(self.smoothing, Smoothing::Active { .. })
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    /// The bound track, if the handle still resolves.
    pub fn track(&self) -> Option<Arc<Track>> {
        self.track.upgrade()
    }

    /// Binds the producer to `track`, which sits at `index` in the track list.
    pub fn bind(&mut self, track: &Arc<Track>, index: usize) {
        self.bind_with(track, index, false);
    }

    pub(crate) fn bind_automatically(&mut self, track: &Arc<Track>, index: usize) {
        self.bind_with(track, index, true);
    }

    fn bind_with(&mut self, track: &Arc<Track>, index: usize, automatic: bool) {
        self.binding = TrackBinding::Track(index);
        self.assigned_automatically = automatic;
        self.track = Arc::downgrade(track);
        self.script_range = track.position_range();
        self.cursor = 0;
        self.last_tick_ms = None;
        self.smoothing = Smoothing::Idle;
        self.needs_resync = true;
        debug!("{} bound to track {} '{}'", self.channel, index, track.name);
    }

    /// Drops the track handle. `Auto` and explicit bindings fall back to
    /// `Auto`; a `Disabled` channel stays disabled.
    pub fn unbind(&mut self) {
        if self.binding != TrackBinding::Disabled {
            self.binding = TrackBinding::Auto;
        }
        self.release();
    }

    /// Marks the channel as explicitly unbound.
    pub fn disable(&mut self) {
        self.binding = TrackBinding::Disabled;
        self.release();
    }

    fn release(&mut self) {
        self.assigned_automatically = false;
        self.track = Weak::new();
        self.script_range = None;
        self.cursor = 0;
        self.last_interpolated = None;
        self.last_tick_ms = None;
        self.smoothing = Smoothing::Idle;
        self.needs_resync = false;
    }

    /// Jumps the cursor to the segment straddling `time_ms`.
    pub fn sync(&mut self, time_ms: f64) {
        match self.track.upgrade() {
            Some(track) => self.sync_with(&track, time_ms),
            None => self.cursor = 0,
        }
    }

    fn sync_with(&mut self, track: &Track, time_ms: f64) {
        self.cursor = track.segment_end(time_ms);
        self.last_tick_ms = None;
        self.needs_resync = false;
    }

    /// Advances to `time_ms` and returns the channel position.
    ///
    /// # Arguments
    /// * `time_ms` - Current play time; expected to increase between calls.
    /// * `tick_rate_hz` - Rate of the control loop, used to derive the tick length.
    /// * `policy` - Interpolation policy for this tick.
    ///
    /// # Returns
    /// * `Some(position)` - Possibly smoothed position, nominally 0..100
    /// * `None` - No track bound, track gone, or track empty
    pub fn tick(&mut self, time_ms: f64, tick_rate_hz: f32, policy: &TickPolicy) -> Option<f32> {
        let Some(track) = self.track.upgrade() else {
            if self.last_interpolated.is_some() {
                debug!("{}: bound track is gone, treating channel as unbound", self.channel);
                self.last_interpolated = None;
                self.last_tick_ms = None;
                self.smoothing = Smoothing::Idle;
            }
            return None;
        };
        if track.is_empty() {
            return None;
        }

        if self.needs_resync {
            self.sync_with(&track, time_ms);
        }

        if let Some(last_tick) = self.last_tick_ms {
            if time_ms == last_tick {
                return self.last_interpolated;
            }
        }

        let moving_forward = self.last_tick_ms.map_or(true, |last| time_ms > last);
        if moving_forward
            && self.cursor < track.len()
            && time_ms >= track.keyframes[self.cursor].at as f64
        {
            self.cursor += 1;
        }

        let raw = self.raw_position(&track, time_ms, policy)?;
        let tick_ms = if tick_rate_hz > 0.0 { 1000.0 / tick_rate_hz } else { 1.0 };
        let output = self.smooth(raw, time_ms, tick_ms);

        self.last_interpolated = Some(output);
        self.last_tick_ms = Some(time_ms);
        Some(output)
    }

    fn raw_position(&self, track: &Track, time_ms: f64, policy: &TickPolicy) -> Option<f32> {
        let raw = funscript_utils::sample_segment(
            &track.keyframes,
            self.cursor,
            time_ms,
            policy.easing,
            policy.spline,
        )?;

        if !policy.remap_to_full_range {
            return Some(raw);
        }
        match self.script_range {
            Some((lo, hi)) if hi > lo => Some((raw - lo as f32) / (hi - lo) as f32 * 100.0),
            _ => Some(raw),
        }
    }

    fn smooth(&mut self, raw: f32, time_ms: f64, tick_ms: f32) -> f32 {
        if let Smoothing::Active {
            target,
            start_value,
            start_time,
        } = self.smoothing
        {
            if time_ms < start_time {
                // Clock jumped back mid-blend: restart from where the output is now
                let current = self.last_interpolated.unwrap_or(raw);
                self.smoothing = Smoothing::Active {
                    target: raw,
                    start_value: current,
                    start_time: time_ms,
                };
                return current;
            }

            let elapsed = time_ms - start_time;
            if elapsed >= MAX_SMOOTHING_MS {
                self.smoothing = Smoothing::Idle;
                return raw;
            }

            let progress = (elapsed / MAX_SMOOTHING_MS) as f32;
            let blended = start_value + (target - start_value) * progress;
            let reached = if target >= start_value {
                blended >= raw
            } else {
                blended <= raw
            };
            if reached {
                self.smoothing = Smoothing::Idle;
                return raw;
            }
            return blended;
        }

        if let Some(last) = self.last_interpolated {
            let speed = (raw - last).abs() / tick_ms;
            if speed > DISCONTINUITY_SPEED {
                debug!(
                    "{}: discontinuity {:.1} -> {:.1} ({:.2}/ms), smoothing",
                    self.channel, last, raw, speed
                );
                self.smoothing = Smoothing::Active {
                    target: raw,
                    start_value: last,
                    start_time: time_ms,
                };
                return last;
            }
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcode::funscript_utils::Keyframe;

    const RATE: f32 = 60.0;
    const TICK_MS: f64 = 1000.0 / 60.0;

    fn track(points: &[(i64, i32)]) -> Arc<Track> {
        Arc::new(Track::new(
            "video",
            points.iter().map(|&(at, pos)| Keyframe::new(at, pos)).collect(),
        ))
    }

    fn triangle() -> Arc<Track> {
        track(&[(0, 50), (1000, 100), (2000, 50)])
    }

    fn bound(track: &Arc<Track>) -> ChannelProducer {
        let mut producer = ChannelProducer::new(ChannelId::L0);
        producer.bind(track, 0);
        producer
    }

    #[test]
    fn binding_sentinels_round_trip() {
        assert_eq!(TrackBinding::from_index(-1), TrackBinding::Auto);
        assert_eq!(TrackBinding::from_index(-2), TrackBinding::Disabled);
        assert_eq!(TrackBinding::from_index(3), TrackBinding::Track(3));
        assert_eq!(TrackBinding::Disabled.as_index(), -2);
    }

    #[test]
    fn sync_then_tick_matches_direct_scan() {
        let track = track(&[(0, 10), (400, 90), (900, 20), (1500, 60), (2200, 0)]);
        let policy = TickPolicy::default();
        for t in [0.0, 130.0, 400.0, 650.0, 1499.0, 1800.0, 2200.0, 3000.0] {
            let mut producer = bound(&track);
            producer.sync(t);
            let position = producer.tick(t, RATE, &policy).unwrap();
            let expected = track.position_at(t).unwrap();
            assert!((position as f64 - expected).abs() < 1e-3, "t={t}: {position} vs {expected}");
        }
    }

    #[test]
    fn repeated_tick_is_idempotent() {
        let track = track(&[(0, 0), (10, 10), (20, 20), (30, 30), (40, 40)]);
        let mut producer = bound(&track);
        let policy = TickPolicy::default();
        producer.sync(0.0);
        let first = producer.tick(35.0, RATE, &policy);
        let cursor = producer.cursor();
        let second = producer.tick(35.0, RATE, &policy);
        assert_eq!(first, second);
        assert_eq!(producer.cursor(), cursor);
    }

    #[test]
    fn cursor_advances_one_keyframe_per_tick_and_never_back() {
        let track = track(&[(0, 0), (10, 0), (20, 0), (30, 0), (40, 0)]);
        let mut producer = bound(&track);
        let policy = TickPolicy::default();
        producer.sync(0.0);
        assert_eq!(producer.cursor(), 1);

        let mut previous = producer.cursor();
        for t in [35.0, 36.0, 37.0, 38.0, 39.0] {
            producer.tick(t, RATE, &policy);
            assert!(producer.cursor() >= previous);
            assert!(producer.cursor() <= previous + 1);
            previous = producer.cursor();
        }
        assert_eq!(producer.cursor(), 4);

        producer.tick(5.0, RATE, &policy);
        assert_eq!(producer.cursor(), 4);
    }

    #[test]
    fn follows_triangle_at_tick_rate() {
        let track = triangle();
        let mut producer = bound(&track);
        let policy = TickPolicy::default();
        producer.sync(0.0);

        let mut t = 0.0;
        let mut at_500 = None;
        let mut at_1500 = None;
        while t <= 2000.0 {
            let position = producer.tick(t, RATE, &policy).unwrap();
            assert!(!producer.is_smoothing());
            if (t - 500.0).abs() < TICK_MS / 2.0 {
                at_500 = Some(position);
            }
            if (t - 1500.0).abs() < TICK_MS / 2.0 {
                at_1500 = Some(position);
            }
            t += TICK_MS;
        }
        assert!((at_500.unwrap() - 75.0).abs() < 1.0);
        assert!((at_1500.unwrap() - 75.0).abs() < 1.0);
        assert_eq!(producer.tick(2000.0, RATE, &policy), Some(50.0));
    }

    #[test]
    fn seek_jump_is_smoothed_and_finishes_within_a_second() {
        let track = track(&[(0, 0), (1000, 0), (1001, 100), (10_000, 100)]);
        let mut producer = bound(&track);
        let policy = TickPolicy::default();
        producer.sync(0.0);
        assert_eq!(producer.tick(0.0, RATE, &policy), Some(0.0));

        producer.sync(5000.0);
        let first = producer.tick(5000.0, RATE, &policy).unwrap();
        assert_eq!(first, 0.0);
        assert!(producer.is_smoothing());

        let mut t = 5000.0;
        let mut previous = first;
        while producer.is_smoothing() {
            t += TICK_MS;
            let position = producer.tick(t, RATE, &policy).unwrap();
            assert!(position >= previous);
            assert!(position - previous < 5.0);
            previous = position;
            assert!(t - 5000.0 <= MAX_SMOOTHING_MS + 2.0 * TICK_MS);
        }
        assert_eq!(previous, 100.0);
    }

    #[test]
    fn smoothing_ends_early_when_live_signal_is_reached() {
        // Jump to 100, then the script itself falls back toward the start value
        let track = track(&[(0, 0), (100, 0), (101, 100), (300, 0)]);
        let mut producer = bound(&track);
        let policy = TickPolicy::default();
        producer.sync(0.0);
        producer.tick(95.0, RATE, &policy);
        producer.tick(101.0, RATE, &policy);
        assert!(producer.is_smoothing());

        let mut t = 101.0;
        while producer.is_smoothing() {
            t += TICK_MS;
            producer.tick(t, RATE, &policy);
        }
        assert!(t < 300.0);
    }

    #[test]
    fn remap_stretches_script_range() {
        let track = track(&[(0, 20), (1000, 60)]);
        let mut producer = bound(&track);
        let policy = TickPolicy {
            remap_to_full_range: true,
            ..Default::default()
        };
        producer.sync(0.0);
        assert_eq!(producer.tick(0.0, RATE, &policy), Some(0.0));
        producer.sync(1000.0);
        // Jump is smoothed; the raw target is still the remapped maximum
        producer.tick(1000.0, RATE, &policy);
        producer.tick(2500.0, RATE, &policy);
        assert_eq!(producer.tick(2600.0, RATE, &policy), Some(100.0));
    }

    #[test]
    fn dropped_track_reads_as_unbound() {
        let track = triangle();
        let mut producer = bound(&track);
        let policy = TickPolicy::default();
        assert!(producer.tick(0.0, RATE, &policy).is_some());
        drop(track);
        assert_eq!(producer.tick(20.0, RATE, &policy), None);
        assert_eq!(producer.binding(), TrackBinding::Track(0));
    }

    #[test]
    fn unbind_keeps_disabled_channels_disabled() {
        let track = triangle();
        let mut producer = bound(&track);
        producer.unbind();
        assert_eq!(producer.binding(), TrackBinding::Auto);
        producer.disable();
        producer.unbind();
        assert_eq!(producer.binding(), TrackBinding::Disabled);
        assert!(producer.track().is_none());
    }
}

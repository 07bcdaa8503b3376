// src/tcode/funscript_utils.rs

//! Funscript data and keyframe interpolation
//!
//! Funscripts are JSON documents holding timestamped positions. They are turned
//! into [`Track`]s, the ordered keyframe sequences read by the channel producers.

use serde::{Deserialize, Serialize};

use super::channel::Easing;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "at")]
    pub at: f64,
    #[serde(rename = "pos")]
    pub pos: f64,
}

/// Wrapper struct to match typical .funscript JSON format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunscriptData {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub inverted: bool,
}

/// A single timestamped position. Positions are nominally 0..100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyframe {
    pub at: i64,
    pub pos: i32,
}

impl Keyframe {
    pub fn new(at: i64, pos: i32) -> Self {
        Self { at, pos }
    }
}

/// An ordered, read-only sequence of keyframes.
///
/// Tracks are shared as `Arc<Track>` by whoever authored them; producers only
/// keep a `Weak` handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub name: String,
    pub keyframes: Vec<Keyframe>,
}

impl Track {
    /// Creates a track, sorting the keyframes by timestamp.
    pub fn new(name: impl Into<String>, mut keyframes: Vec<Keyframe>) -> Self {
        keyframes.sort_by_key(|k| k.at);
        Self {
            name: name.into(),
            keyframes,
        }
    }

    /// Converts parsed funscript data into a track.
    ///
    /// Fractional timestamps and positions are rounded. Scripts flagged as
    /// `inverted` are flipped so every track shares the same orientation.
    pub fn from_funscript(name: impl Into<String>, data: &FunscriptData) -> Self {
        let keyframes = data
            .actions
            .iter()
            .filter(|a| a.at.is_finite() && a.pos.is_finite())
            .map(|a| {
                let pos = if data.inverted { 100.0 - a.pos } else { a.pos };
                Keyframe::new(a.at.round() as i64, pos.round() as i32)
            })
            .collect();
        Self::new(name, keyframes)
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    /// Lowest and highest position found across all keyframes.
    pub fn position_range(&self) -> Option<(i32, i32)> {
        let min = self.keyframes.iter().map(|k| k.pos).min()?;
        let max = self.keyframes.iter().map(|k| k.pos).max()?;
        Some((min, max))
    }

    /// Index of the first keyframe strictly after `time_ms`.
    ///
    /// The segment straddling `time_ms` is `(index - 1, index)`; `0` means the
    /// time lies before the first keyframe and `len()` means after the last.
    pub fn segment_end(&self, time_ms: f64) -> usize {
        self.keyframes.partition_point(|k| (k.at as f64) <= time_ms)
    }

    /// Position at `time_ms` found by a full scan and linear interpolation.
    pub fn position_at(&self, time_ms: f64) -> Option<f64> {
        if self.keyframes.is_empty() {
            return None;
        }
        let before = self.keyframes.iter().rev().find(|k| (k.at as f64) <= time_ms);
        let after = self.keyframes.iter().find(|k| (k.at as f64) > time_ms);
        Some(interpolate_position(before, after, time_ms))
    }
}

/// Calculates the position at a specific time between two keyframes using linear interpolation.
///
/// # Arguments
/// * `a0` - The keyframe at or before the target time, if any.
/// * `a1` - The keyframe after the target time, if any.
/// * `time` - The target time in milliseconds.
///
/// # Returns
/// The interpolated position.
pub fn interpolate_position(a0: Option<&Keyframe>, a1: Option<&Keyframe>, time: f64) -> f64 {
    match (a0, a1) {
        (None, None) => 0.0,
        (None, Some(k1)) => k1.pos as f64,
        (Some(k0), None) => k0.pos as f64,
        (Some(k0), Some(k1)) => {
            if time <= k0.at as f64 {
                return k0.pos as f64;
            }
            if time >= k1.at as f64 {
                return k1.pos as f64;
            }
            if k0.at == k1.at {
                // Avoid division by zero if times are identical
                return k0.pos as f64;
            }

            let time_fraction = (time - k0.at as f64) / (k1.at - k0.at) as f64;
            k0.pos as f64 + (k1.pos - k0.pos) as f64 * time_fraction
        }
    }
}

/// Samples the segment ending at keyframe index `end` (see [`Track::segment_end`]).
///
/// # Arguments
/// * `keyframes` - Keyframes of the bound track, sorted by time.
/// * `end` - Cursor of the producer; the segment is `(end - 1, end)`.
/// * `time_ms` - Play time to sample at. Clamped to the segment bounds.
/// * `easing` - Easing applied to the segment progress.
/// * `spline` - Use Catmull-Rom through the neighbouring keyframes instead of a straight line.
///
/// # Returns
/// `None` when there are no keyframes.
pub fn sample_segment(
    keyframes: &[Keyframe],
    end: usize,
    time_ms: f64,
    easing: Easing,
    spline: bool,
) -> Option<f32> {
    let last = keyframes.len().checked_sub(1)?;
    if end == 0 {
        return Some(keyframes[0].pos as f32);
    }
    if end > last {
        return Some(keyframes[last].pos as f32);
    }

    let k0 = keyframes[end - 1];
    let k1 = keyframes[end];
    let span = (k1.at - k0.at) as f64;
    if span <= 0.0 {
        return Some(k1.pos as f32);
    }

    let progress = ((time_ms - k0.at as f64) / span).clamp(0.0, 1.0) as f32;
    let progress = easing.apply(progress);

    if spline {
        let p0 = keyframes[end.saturating_sub(2)].pos as f32;
        let p3 = keyframes[(end + 1).min(last)].pos as f32;
        Some(catmull_rom(p0, k0.pos as f32, k1.pos as f32, p3, progress))
    } else {
        Some(k0.pos as f32 + (k1.pos - k0.pos) as f32 * progress)
    }
}

fn catmull_rom(p0: f32, p1: f32, p2: f32, p3: f32, t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * ((2.0 * p1)
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Track {
        Track::new(
            "video",
            vec![Keyframe::new(0, 50), Keyframe::new(1000, 100), Keyframe::new(2000, 50)],
        )
    }

    #[test]
    fn from_funscript_rounds_and_sorts() {
        let json = r#"{"actions":[{"at":1000.4,"pos":99.6},{"at":0,"pos":10}]}"#;
        let data: FunscriptData = serde_json::from_str(json).unwrap();
        let track = Track::from_funscript("video", &data);
        assert_eq!(track.keyframes, vec![Keyframe::new(0, 10), Keyframe::new(1000, 100)]);
    }

    #[test]
    fn inverted_scripts_are_flipped() {
        let json = r#"{"inverted":true,"actions":[{"at":0,"pos":20}]}"#;
        let data: FunscriptData = serde_json::from_str(json).unwrap();
        assert_eq!(Track::from_funscript("x", &data).keyframes[0].pos, 80);
    }

    #[test]
    fn segment_end_brackets_time() {
        let track = triangle();
        assert_eq!(track.segment_end(-5.0), 0);
        assert_eq!(track.segment_end(0.0), 1);
        assert_eq!(track.segment_end(999.0), 1);
        assert_eq!(track.segment_end(1000.0), 2);
        assert_eq!(track.segment_end(2500.0), 3);
    }

    #[test]
    fn position_at_scans_linearly() {
        let track = triangle();
        assert_eq!(track.position_at(500.0), Some(75.0));
        assert_eq!(track.position_at(1500.0), Some(75.0));
        assert_eq!(track.position_at(2000.0), Some(50.0));
        assert_eq!(track.position_at(9000.0), Some(50.0));
        assert_eq!(Track::new("empty", vec![]).position_at(0.0), None);
    }

    #[test]
    fn sample_segment_matches_scan() {
        let track = triangle();
        for t in [0.0, 250.0, 500.0, 1250.0, 1999.0] {
            let end = track.segment_end(t);
            let sampled = sample_segment(&track.keyframes, end, t, Easing::None, false).unwrap();
            let scanned = track.position_at(t).unwrap();
            assert!((sampled as f64 - scanned).abs() < 1e-4, "t={t}");
        }
    }

    #[test]
    fn cubic_easing_keeps_endpoints_and_midpoint() {
        let track = triangle();
        let at = |t: f64| sample_segment(&track.keyframes, 1, t, Easing::Cubic, false).unwrap();
        assert_eq!(at(0.0), 50.0);
        assert_eq!(at(500.0), 75.0);
        assert_eq!(at(1000.0), 100.0);
        assert!(at(250.0) < 62.5);
    }

    #[test]
    fn spline_passes_through_keyframes() {
        let track = triangle();
        let at = |t: f64| sample_segment(&track.keyframes, 1, t, Easing::None, true).unwrap();
        assert!((at(0.0) - 50.0).abs() < 1e-4);
        assert!((at(1000.0) - 100.0).abs() < 1e-4);
    }
}

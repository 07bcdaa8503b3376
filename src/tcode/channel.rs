// src/tcode/channel.rs

//! T-Code output channels
//!
//! A [`Channel`] is one logical device axis. It turns an interpolated 0..100
//! position into a quantized device value, guards the hardware against
//! implausibly fast moves, and suppresses commands that would not change
//! anything.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::str::FromStr;

/// Lowest value the T-Code device accepts.
pub const DEVICE_MIN: i32 = 0;
/// Highest value the T-Code device accepts (three digits).
pub const DEVICE_MAX: i32 = 999;
const DEVICE_NEUTRAL: i32 = 500;

/// Fastest movement a channel will ever command, in device units per millisecond.
pub const MAX_DEVICE_SPEED: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChannelId {
    L0,
    L1,
    L2,
    R0,
    R1,
    R2,
    V0,
    V1,
    V2,
}

impl ChannelId {
    /// Every channel, in wire order.
    pub const ALL: [ChannelId; 9] = [
        ChannelId::L0,
        ChannelId::L1,
        ChannelId::L2,
        ChannelId::R0,
        ChannelId::R1,
        ChannelId::R2,
        ChannelId::V0,
        ChannelId::V1,
        ChannelId::V2,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelId::L0 => "L0",
            ChannelId::L1 => "L1",
            ChannelId::L2 => "L2",
            ChannelId::R0 => "R0",
            ChannelId::R1 => "R1",
            ChannelId::R2 => "R2",
            ChannelId::V0 => "V0",
            ChannelId::V1 => "V1",
            ChannelId::V2 => "V2",
        }
    }

    /// Lowercase track-name suffixes that bind a track to this channel.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            ChannelId::L0 => &["stroke", "l0"],
            ChannelId::L1 => &["surge", "l1"],
            ChannelId::L2 => &["sway", "l2"],
            ChannelId::R0 => &["twist", "r0"],
            ChannelId::R1 => &["roll", "r1"],
            ChannelId::R2 => &["pitch", "r2"],
            ChannelId::V0 => &["vib", "v0"],
            ChannelId::V1 => &["pump", "v1"],
            ChannelId::V2 => &["lube", "v2"],
        }
    }

    /// Whether a track called `name` ends with one of this channel's aliases.
    pub fn matches_track_name(self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.aliases().iter().any(|alias| name.ends_with(alias))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown channel id: {}", s))
    }
}

/// Easing applied to segment progress before interpolating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Easing {
    #[default]
    None,
    Cubic,
}

impl Easing {
    pub fn apply(self, progress: f32) -> f32 {
        match self {
            Easing::None => progress,
            Easing::Cubic => progress * progress * (3.0 - 2.0 * progress),
        }
    }
}

/// A single device command: channel plus quantized value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Command {
    pub channel: ChannelId,
    pub value: i32,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:03}", self.channel, self.value)
    }
}

/// Builds one newline-terminated frame out of the commands of a tick.
///
/// Returns `None` when there is nothing to send.
pub fn format_frame(commands: &[Command]) -> Option<String> {
    if commands.is_empty() {
        return None;
    }
    let mut frame = String::with_capacity(commands.len() * 6 + 1);
    for command in commands {
        // Writing into a String cannot fail
        let _ = write!(frame, "{} ", command);
    }
    frame.push('\n');
    Some(frame)
}

/// User-facing configuration of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub min: i32,
    pub max: i32,
    pub enabled: bool,
    pub invert: bool,
    pub rebalance: bool,
    pub easing: Easing,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            min: 100,
            max: 900,
            enabled: true,
            invert: false,
            rebalance: false,
            easing: Easing::None,
        }
    }
}

impl ChannelSettings {
    /// Clamps the limits into the device range and puts them in order.
    pub fn sanitized(mut self) -> Self {
        let a = self.min.clamp(DEVICE_MIN, DEVICE_MAX);
        let b = self.max.clamp(DEVICE_MIN, DEVICE_MAX);
        self.min = a.min(b);
        self.max = a.max(b);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    settings: ChannelSettings,
    last_emitted: Option<i32>,
}

impl Channel {
    pub fn new(id: ChannelId) -> Self {
        Self::with_settings(id, ChannelSettings::default())
    }

    pub fn with_settings(id: ChannelId, settings: ChannelSettings) -> Self {
        Self {
            id,
            settings: settings.sanitized(),
            last_emitted: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// Replaces the configuration. The last emitted value is kept so the
    /// jitter guard still applies across the change.
    pub fn apply_settings(&mut self, settings: ChannelSettings) {
        self.settings = settings.sanitized();
    }

    pub fn last_emitted(&self) -> Option<i32> {
        self.last_emitted
    }

    pub fn reset(&mut self) {
        self.last_emitted = None;
    }

    /// Maps a 0..100 position onto the channel's limits.
    pub fn device_value(&self, position: f32) -> i32 {
        let position = if position.is_nan() { 50.0 } else { position };
        let mut fraction = position.clamp(0.0, 100.0) / 100.0;
        if self.settings.invert {
            fraction = 1.0 - fraction;
        }

        let min = self.settings.min as f32;
        let max = self.settings.max as f32;
        let neutral = DEVICE_NEUTRAL as f32;
        let value = if self.settings.rebalance && min < neutral && neutral < max {
            if fraction < 0.5 {
                min + (neutral - min) * (fraction / 0.5)
            } else {
                neutral + (max - neutral) * ((fraction - 0.5) / 0.5)
            }
        } else {
            min + (max - min) * fraction
        };
        value.round() as i32
    }

    /// Computes the command for this tick, if any.
    ///
    /// # Arguments
    /// * `position` - Interpolated position, 0..100.
    /// * `tick_duration_ms` - Length of one tick; used to derive the implied speed.
    ///
    /// # Returns
    /// * `Some(Command)` - The device value changed
    /// * `None` - Channel disabled or value unchanged
    pub fn compute_command(&mut self, position: f32, tick_duration_ms: f32) -> Option<Command> {
        if !self.settings.enabled {
            return None;
        }

        let target = self.device_value(position);
        let value = match self.last_emitted {
            Some(last) if tick_duration_ms > 0.0 => {
                let speed = (target - last).abs() as f32 / tick_duration_ms;
                if speed > MAX_DEVICE_SPEED {
                    let max_step = ((MAX_DEVICE_SPEED * tick_duration_ms).floor() as i32).max(1);
                    let clamped = (last + max_step * (target - last).signum())
                        .clamp(self.settings.min, self.settings.max);
                    debug!(
                        "{}: clamped jump {} -> {} ({:.1} units/ms) to {}",
                        self.id, last, target, speed, clamped
                    );
                    clamped
                } else {
                    target
                }
            }
            _ => target,
        };

        if self.last_emitted == Some(value) {
            return None;
        }
        self.last_emitted = Some(value);
        Some(Command {
            channel: self.id,
            value,
        })
    }
}

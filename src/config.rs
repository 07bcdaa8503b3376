// src/config.rs

//! Player configuration
//!
//! Loaded once at startup from an optional JSON file named by `TCODE_CONFIG`,
//! then overridden by individual environment variables (a `.env` file is
//! honoured through `dotenv`). The web frontend reads and replaces it as a
//! whole through `/site/config`.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{env, fs, path::Path};

use crate::tcode::channel::{ChannelId, ChannelSettings, Easing};
use crate::tcode::control_loop::LoopSettings;
use crate::tcode::producer::TickPolicy;
use crate::tcode::transport::DEFAULT_BAUD_RATE;

pub const MIN_TICK_RATE_HZ: f32 = 30.0;
pub const MAX_TICK_RATE_HZ: f32 = 300.0;
pub const DEFAULT_TICK_RATE_HZ: f32 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub tick_rate_hz: f32,
    /// Subtracted from the external clock; positive values make the device lag the video.
    pub delay_offset_ms: f64,
    pub easing: Easing,
    pub spline: bool,
    pub remap_to_full_range: bool,
    /// Serial port path, or `-` for stdout. `None` until the user picks one.
    pub serial_port: Option<String>,
    pub baud_rate: u32,
    pub channels: BTreeMap<ChannelId, ChannelSettings>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: DEFAULT_TICK_RATE_HZ,
            delay_offset_ms: 0.0,
            easing: Easing::None,
            spline: false,
            remap_to_full_range: false,
            serial_port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            channels: ChannelId::ALL
                .iter()
                .map(|id| (*id, ChannelSettings::default()))
                .collect(),
        }
    }
}

impl PlayerConfig {
    /// Builds the configuration from `TCODE_CONFIG` and the process environment.
    ///
    /// # Returns
    /// * `Ok(PlayerConfig)` - Sanitized configuration
    /// * `Err(String)` - The config file is unreadable or an override does not parse
    pub fn from_env() -> Result<Self, String> {
        let mut config = match env::var("TCODE_CONFIG") {
            Ok(path) => {
                info!("Loading player configuration from {}", path);
                Self::from_file(Path::new(&path))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config.sanitized())
    }

    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {:?}: {}", path, e))?;
        let config: PlayerConfig = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to deserialize config {:?}: {}", path, e))?;
        Ok(config.sanitized())
    }

    /// Applies `TCODE_PORT`, `TCODE_BAUD`, `TCODE_TICK_RATE` and `TCODE_DELAY_MS`.
    ///
    /// # Arguments
    /// * `lookup` - Resolves a variable name to its value, if set
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("TCODE_PORT") {
            let port = port.trim().to_string();
            self.serial_port = if port.is_empty() { None } else { Some(port) };
        }
        if let Some(baud) = lookup("TCODE_BAUD") {
            self.baud_rate = parse_override("TCODE_BAUD", &baud)?;
        }
        if let Some(rate) = lookup("TCODE_TICK_RATE") {
            self.tick_rate_hz = parse_override("TCODE_TICK_RATE", &rate)?;
        }
        if let Some(delay) = lookup("TCODE_DELAY_MS") {
            self.delay_offset_ms = parse_override("TCODE_DELAY_MS", &delay)?;
        }
        Ok(())
    }

    /// Clamps every value into its valid range.
    pub fn sanitized(mut self) -> Self {
        let rate = if self.tick_rate_hz.is_finite() {
            self.tick_rate_hz
        } else {
            DEFAULT_TICK_RATE_HZ
        };
        let clamped = rate.clamp(MIN_TICK_RATE_HZ, MAX_TICK_RATE_HZ);
        if clamped != self.tick_rate_hz {
            warn!(
                "Tick rate {} Hz out of range, using {} Hz",
                self.tick_rate_hz, clamped
            );
        }
        self.tick_rate_hz = clamped;

        if !self.delay_offset_ms.is_finite() {
            self.delay_offset_ms = 0.0;
        }
        if self.baud_rate == 0 {
            self.baud_rate = DEFAULT_BAUD_RATE;
        }
        for settings in self.channels.values_mut() {
            *settings = settings.sanitized();
        }
        self
    }

    /// Settings of one channel; channels absent from the map use the defaults.
    pub fn channel(&self, id: ChannelId) -> ChannelSettings {
        self.channels.get(&id).copied().unwrap_or_default()
    }

    /// Settings for every channel, in wire order.
    pub fn channel_settings(&self) -> Vec<(ChannelId, ChannelSettings)> {
        ChannelId::ALL.iter().map(|id| (*id, self.channel(*id))).collect()
    }

    pub fn policy(&self) -> TickPolicy {
        TickPolicy {
            easing: self.easing,
            spline: self.spline,
            remap_to_full_range: self.remap_to_full_range,
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            tick_rate_hz: self.tick_rate_hz,
            delay_offset_ms: self.delay_offset_ms,
            policy: self.policy(),
        }
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("Invalid value '{}' for {}: {}", value, key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_cover_every_channel() {
        let config = PlayerConfig::default();
        assert_eq!(config.channels.len(), ChannelId::ALL.len());
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.loop_settings().tick_rate_hz, 60.0);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tick_rate_hz": 120, "channels": {{"R1": {{"min": 950, "max": 20, "invert": true}}}}}}"#
        )
        .unwrap();

        let config = PlayerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tick_rate_hz, 120.0);
        assert!(!config.spline);

        let r1 = config.channel(ChannelId::R1);
        assert_eq!((r1.min, r1.max), (20, 950));
        assert!(r1.invert);
        assert_eq!(config.channel(ChannelId::L0), ChannelSettings::default());
    }

    #[test]
    fn default_policy_maps_the_reference_scenario() {
        use crate::tcode::funscript_utils::{Keyframe, Track};
        use crate::tcode::producer_set::ProducerSet;
        use std::sync::Arc;

        let config = PlayerConfig::default();
        let tracks = vec![Arc::new(Track::new(
            "video",
            vec![Keyframe::new(0, 50), Keyframe::new(1000, 100), Keyframe::new(2000, 50)],
        ))];
        let mut producers = ProducerSet::new();
        producers.set_channels(config.channels.iter().map(|(id, s)| (*id, s)));
        producers.set_tracks(&tracks);
        producers.sync(500.0);

        let commands = producers.tick(500.0, config.tick_rate_hz, &config.policy());
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].channel, ChannelId::L0);
        assert_eq!(commands[0].value, 700);
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PlayerConfig::from_file(&dir.path().join("missing.json")).unwrap_err();
        assert!(err.contains("missing.json"));
    }

    #[test]
    fn environment_overrides_apply() {
        let mut config = PlayerConfig::default();
        config
            .apply_overrides(lookup_from(&[
                ("TCODE_PORT", "-"),
                ("TCODE_BAUD", "9600"),
                ("TCODE_TICK_RATE", "1000"),
                ("TCODE_DELAY_MS", " 35.5 "),
            ]))
            .unwrap();
        let config = config.sanitized();
        assert_eq!(config.serial_port.as_deref(), Some("-"));
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.tick_rate_hz, MAX_TICK_RATE_HZ);
        assert_eq!(config.delay_offset_ms, 35.5);
    }

    #[test]
    fn bad_override_names_the_variable() {
        let mut config = PlayerConfig::default();
        let err = config
            .apply_overrides(lookup_from(&[("TCODE_BAUD", "fast")]))
            .unwrap_err();
        assert!(err.contains("TCODE_BAUD"));
    }

    #[test]
    fn low_tick_rate_is_raised() {
        let config = PlayerConfig {
            tick_rate_hz: 5.0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.tick_rate_hz, MIN_TICK_RATE_HZ);
    }
}

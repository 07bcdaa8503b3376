// src/tcode/player.rs

//! T-Code player facade
//!
//! Owns everything the web handlers talk to: the configuration, the loaded
//! tracks, the device transport and the control loop. A single instance lives
//! behind a process-wide mutex; the clock handoff is kept in its own global so
//! clock updates never wait for that mutex.

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::config::PlayerConfig;

use super::channel::{format_frame, ChannelId};
use super::clock::ClockHandoff;
use super::control_loop::{ControlLoop, LoopCommand, LoopParts, LoopState};
use super::funscript_utils::Track;
use super::producer::TrackBinding;
use super::producer_set::{ChannelMonitor, ChannelStatus, ProducerSet};
use super::transport::{self, Transport};

static PLAYER: OnceCell<Mutex<TCodePlayer>> = OnceCell::new();
static CLOCK: OnceCell<Arc<ClockHandoff>> = OnceCell::new();

#[derive(Debug, Clone, Serialize)]
pub struct PlayerStatus {
    pub playing: bool,
    pub port: Option<String>,
    pub tracks: Vec<String>,
    pub channels: Vec<ChannelStatus>,
}

pub struct TCodePlayer {
    config: PlayerConfig,
    clock: Arc<ClockHandoff>,
    monitor: Arc<ChannelMonitor>,
    tracks: Vec<Arc<Track>>,
    /// Bindings chosen by the user, re-applied whenever playback starts.
    explicit_bindings: BTreeMap<ChannelId, TrackBinding>,
    /// `None` while the control loop owns the transport.
    transport: Option<Box<dyn Transport>>,
    /// Empty while the control loop owns the producers.
    producers: ProducerSet,
    control_loop: Option<ControlLoop>,
}

impl TCodePlayer {
    pub fn new(config: PlayerConfig) -> Self {
        let config = config.sanitized();
        let mut producers = ProducerSet::new();
        producers.set_channels(config.channels.iter().map(|(id, s)| (*id, s)));
        let monitor = Arc::new(ChannelMonitor::new());
        monitor.refresh(&producers);

        Self {
            config,
            clock: Arc::new(ClockHandoff::new()),
            monitor,
            tracks: Vec::new(),
            explicit_bindings: BTreeMap::new(),
            transport: None,
            producers,
            control_loop: None,
        }
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Replaces the configuration. Takes effect on the next tick when playing.
    ///
    /// Port and baud rate changes apply the next time the port is opened.
    pub fn apply_config(&mut self, config: PlayerConfig) {
        let config = config.sanitized();
        match &self.control_loop {
            Some(control_loop) => {
                for (id, settings) in config.channel_settings() {
                    control_loop.send(LoopCommand::SetChannel(id, settings));
                }
                control_loop.send(LoopCommand::SetSettings(config.loop_settings()));
            }
            None => {
                let settings = config.channel_settings();
                self.producers
                    .set_channels(settings.iter().map(|(id, s)| (*id, s)));
            }
        }
        info!(
            "Configuration updated: {} Hz, delay {} ms",
            config.tick_rate_hz, config.delay_offset_ms
        );
        self.config = config;
    }

    pub fn clock(&self) -> Arc<ClockHandoff> {
        Arc::clone(&self.clock)
    }

    pub fn monitor(&self) -> Arc<ChannelMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Opens the device port.
    ///
    /// # Arguments
    /// * `path` - Port to open; falls back to the configured one when `None`
    ///
    /// # Returns
    /// * `Ok(String)` - Description of the opened transport
    /// * `Err(String)` - Playing, no port known, or the port failed to open
    pub fn open_port(&mut self, path: Option<&str>) -> Result<String, String> {
        if self.is_playing() {
            return Err("Stop playback before changing the port".to_string());
        }
        let path = path
            .map(str::to_string)
            .or_else(|| self.config.serial_port.clone())
            .ok_or_else(|| "No serial port configured".to_string())?;

        let transport = transport::open_transport(&path, self.config.baud_rate)?;
        let description = transport.describe();
        self.transport = Some(transport);
        self.config.serial_port = Some(path);
        Ok(description)
    }

    /// Uses an already opened transport.
    pub fn attach_transport(&mut self, transport: Box<dyn Transport>) -> Result<(), String> {
        if self.is_playing() {
            return Err("Stop playback before changing the port".to_string());
        }
        info!("Attached transport {}", transport.describe());
        self.transport = Some(transport);
        Ok(())
    }

    /// Stops playback if needed and releases the port.
    pub fn close_port(&mut self) -> Result<(), String> {
        self.stop()?;
        if let Some(transport) = self.transport.take() {
            info!("Closed {}", transport.describe());
        }
        Ok(())
    }

    pub fn is_port_open(&self) -> bool {
        self.transport.is_some() || self.is_playing()
    }

    /// Installs a new track list and re-assigns channels.
    pub fn set_tracks(&mut self, tracks: Vec<Arc<Track>>) {
        let count = tracks.len();
        self.explicit_bindings.retain(|_, binding| match binding {
            TrackBinding::Track(index) => *index < count,
            _ => true,
        });
        self.tracks = tracks;

        match &self.control_loop {
            Some(control_loop) => {
                control_loop.send(LoopCommand::SetTracks(self.tracks.clone()));
            }
            None => {
                self.producers.set_tracks(&self.tracks);
                self.monitor.refresh(&self.producers);
            }
        }
        info!("Loaded {} track(s)", count);
    }

    pub fn tracks(&self) -> &[Arc<Track>] {
        &self.tracks
    }

    /// Binds a channel by hand.
    ///
    /// # Returns
    /// * `Err(String)` - The track index does not exist
    pub fn bind_channel(&mut self, id: ChannelId, binding: TrackBinding) -> Result<(), String> {
        if let TrackBinding::Track(index) = binding {
            if index >= self.tracks.len() {
                return Err(format!(
                    "No track at index {} for {} ({} loaded)",
                    index,
                    id,
                    self.tracks.len()
                ));
            }
        }
        match binding {
            TrackBinding::Auto => self.explicit_bindings.remove(&id),
            _ => self.explicit_bindings.insert(id, binding),
        };

        match &self.control_loop {
            Some(control_loop) => {
                control_loop.send(LoopCommand::SetBinding(id, binding));
                if binding == TrackBinding::Auto {
                    // Auto only takes effect through a fresh assignment pass
                    control_loop.send(LoopCommand::SetTracks(self.tracks.clone()));
                }
                Ok(())
            }
            None => {
                self.producers.set_binding(id, binding)?;
                if binding == TrackBinding::Auto {
                    self.producers.set_tracks(&self.tracks);
                }
                self.monitor.refresh(&self.producers);
                Ok(())
            }
        }
    }

    /// Publishes the external clock. Never blocks on the control loop.
    pub fn publish_clock(&self, time_ms: f64, speed: f64) {
        self.clock.publish(time_ms, speed);
    }

    pub fn is_playing(&self) -> bool {
        self.control_loop
            .as_ref()
            .map_or(false, |control_loop| control_loop.state() != LoopState::Stopped)
    }

    /// Starts the control loop at `initial_time_ms`. A no-op while playing.
    ///
    /// # Returns
    /// * `Err(String)` - No port is open, or the loop thread failed to start
    pub fn play(&mut self, initial_time_ms: f64) -> Result<(), String> {
        if self.is_playing() {
            debug!("play() while already playing, ignored");
            return Ok(());
        }
        let transport = self
            .transport
            .take()
            .ok_or_else(|| "No device opened, open a port first".to_string())?;

        let mut producers = std::mem::take(&mut self.producers);
        let settings = self.config.channel_settings();
        producers.set_channels(settings.iter().map(|(id, s)| (*id, s)));
        producers.set_tracks(&self.tracks);
        for (id, binding) in &self.explicit_bindings {
            if let Err(e) = producers.set_binding(*id, *binding) {
                warn!("Dropping binding of {}: {}", id, e);
            }
        }

        self.clock.publish_time(initial_time_ms);
        let control_loop = ControlLoop::start(
            LoopParts {
                transport,
                producers,
            },
            Arc::clone(&self.clock),
            Arc::clone(&self.monitor),
            self.config.loop_settings(),
            initial_time_ms,
        )?;
        self.control_loop = Some(control_loop);
        Ok(())
    }

    /// Stops the control loop and takes the transport back. A no-op while stopped.
    pub fn stop(&mut self) -> Result<(), String> {
        let Some(mut control_loop) = self.control_loop.take() else {
            return Ok(());
        };
        match control_loop.stop() {
            Ok(parts) => {
                self.transport = Some(parts.transport);
                self.producers = parts.producers;
                Ok(())
            }
            Err(e) => {
                if control_loop.state() != LoopState::Stopped {
                    self.control_loop = Some(control_loop);
                }
                Err(e)
            }
        }
    }

    /// Jumps to `time_ms` without stopping, e.g. after a seek.
    pub fn sync(&mut self, time_ms: f64) {
        self.clock.publish_time(time_ms);
        match &self.control_loop {
            Some(control_loop) => control_loop.send(LoopCommand::Resync(time_ms)),
            None => self
                .producers
                .sync(time_ms - self.config.delay_offset_ms),
        }
    }

    /// Sends a single position to one channel while stopped.
    ///
    /// # Returns
    /// * `Ok(Some(frame))` - The frame written to the device
    /// * `Ok(None)` - Nothing to send; the channel is disabled or already there
    /// * `Err(String)` - Playing, no port open, or the write failed
    pub fn preview(&mut self, id: ChannelId, position: f32) -> Result<Option<String>, String> {
        if self.is_playing() {
            return Err("Preview is not available while playing".to_string());
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| "No device opened, open a port first".to_string())?;

        let Some(command) = self.producers.preview(id, position) else {
            return Ok(None);
        };
        let commands = [command];
        let Some(frame) = format_frame(&commands) else {
            return Ok(None);
        };
        transport
            .write_frame(frame.as_bytes())
            .map_err(|e| format!("Failed to write preview to {}: {}", transport.describe(), e))?;
        self.monitor.record_commands(&commands);
        Ok(Some(frame))
    }

    pub fn status(&self) -> PlayerStatus {
        PlayerStatus {
            playing: self.is_playing(),
            port: self.config.serial_port.clone().filter(|_| self.is_port_open()),
            tracks: self.tracks.iter().map(|t| t.name.clone()).collect(),
            channels: self.monitor.snapshot(),
        }
    }
}

/// Creates the process-wide player and opens the configured port, if any.
///
/// A port that fails to open is logged and left closed.
pub fn initialize_player(config: PlayerConfig) -> Result<(), String> {
    let mut player = TCodePlayer::new(config);
    if player.config().serial_port.is_some() {
        match player.open_port(None) {
            Ok(description) => info!("T-Code device ready on {}", description),
            Err(e) => warn!("{}", e),
        }
    }

    CLOCK
        .set(player.clock())
        .map_err(|_| "Player already initialized".to_string())?;
    PLAYER
        .set(Mutex::new(player))
        .map_err(|_| "Player already initialized".to_string())
}

/// Publishes the external clock without touching the player lock.
pub fn publish_clock(time_ms: f64, speed: f64) {
    if let Some(clock) = CLOCK.get() {
        clock.publish(time_ms, speed);
    }
}

/// Runs `f` with exclusive access to the player.
pub fn with_player<R>(f: impl FnOnce(&mut TCodePlayer) -> R) -> Result<R, String> {
    let player = PLAYER
        .get()
        .ok_or_else(|| "Player not initialized".to_string())?;
    let mut guard = player
        .lock()
        .map_err(|_| "Player lock poisoned".to_string())?;
    Ok(f(&mut guard))
}

/// Stops playback and releases the device.
pub fn shutdown_player() {
    match with_player(|player| player.close_port()) {
        Ok(Ok(())) => info!("Player shut down"),
        Ok(Err(e)) | Err(e) => warn!("Player shutdown: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcode::funscript_utils::Keyframe;
    use crate::tcode::transport::testing::RecordingTransport;
    use std::thread;
    use std::time::Duration;

    fn tracks() -> Vec<Arc<Track>> {
        vec![
            Arc::new(Track::new(
                "video",
                vec![Keyframe::new(0, 50), Keyframe::new(1000, 100), Keyframe::new(2000, 50)],
            )),
            Arc::new(Track::new(
                "video.roll",
                vec![Keyframe::new(0, 0), Keyframe::new(2000, 100)],
            )),
        ]
    }

    fn player_with_device() -> (TCodePlayer, RecordingTransport) {
        let transport = RecordingTransport::default();
        let mut player = TCodePlayer::new(PlayerConfig::default());
        player.attach_transport(Box::new(transport.clone())).unwrap();
        player.set_tracks(tracks());
        (player, transport)
    }

    #[test]
    fn play_without_device_fails() {
        let mut player = TCodePlayer::new(PlayerConfig::default());
        player.set_tracks(tracks());
        let err = player.play(0.0).unwrap_err();
        assert!(err.contains("No device"));
        assert!(!player.is_playing());
    }

    #[test]
    fn play_stop_play_round_trip() {
        let (mut player, transport) = player_with_device();
        player.publish_clock(0.0, 1.0);
        player.play(0.0).unwrap();
        assert!(player.is_playing());
        assert!(player.play(500.0).is_ok());
        assert!(player.attach_transport(Box::new(RecordingTransport::default())).is_err());

        thread::sleep(Duration::from_millis(150));
        player.stop().unwrap();
        assert!(!player.is_playing());
        assert!(player.is_port_open());
        assert_eq!(player.monitor().binding(ChannelId::L0), TrackBinding::Auto);
        let frames = transport.frames();
        assert!(!frames.is_empty());
        assert!(frames[0].starts_with("L0500 R1100 "));

        player.play(0.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(player.monitor().binding(ChannelId::L0), TrackBinding::Track(0));
        player.stop().unwrap();
        assert!(player.stop().is_ok());
    }

    #[test]
    fn explicit_bindings_survive_restarts() {
        let (mut player, _transport) = player_with_device();
        player.bind_channel(ChannelId::L1, TrackBinding::Track(1)).unwrap();
        player.bind_channel(ChannelId::R1, TrackBinding::Disabled).unwrap();
        assert_eq!(player.monitor().binding(ChannelId::L1), TrackBinding::Track(1));

        player.play(0.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        player.stop().unwrap();
        player.play(0.0).unwrap();
        thread::sleep(Duration::from_millis(50));
        let monitor = player.monitor();
        assert_eq!(monitor.binding(ChannelId::L1), TrackBinding::Track(1));
        assert_eq!(monitor.binding(ChannelId::R1), TrackBinding::Disabled);
        player.stop().unwrap();
    }

    #[test]
    fn binding_to_unknown_track_fails() {
        let (mut player, _transport) = player_with_device();
        assert!(player.bind_channel(ChannelId::V0, TrackBinding::Track(5)).is_err());
    }

    #[test]
    fn returning_to_auto_reassigns_by_name() {
        let (mut player, _transport) = player_with_device();
        player.bind_channel(ChannelId::R1, TrackBinding::Track(0)).unwrap();
        player.bind_channel(ChannelId::R1, TrackBinding::Auto).unwrap();
        assert_eq!(player.monitor().binding(ChannelId::R1), TrackBinding::Track(1));
    }

    #[test]
    fn preview_writes_one_command_while_stopped() {
        let (mut player, transport) = player_with_device();
        let frame = player.preview(ChannelId::L0, 50.0).unwrap();
        assert_eq!(frame.as_deref(), Some("L0500 \n"));
        assert_eq!(player.preview(ChannelId::L0, 50.0).unwrap(), None);
        assert_eq!(transport.frames(), vec!["L0500 \n".to_string()]);
        assert_eq!(player.monitor().last_value(ChannelId::L0), Some(500));

        // Far beyond one tick's step limit, still reached in one write
        let frame = player.preview(ChannelId::L0, 0.0).unwrap();
        assert_eq!(frame.as_deref(), Some("L0100 \n"));
        assert_eq!(player.monitor().last_value(ChannelId::L0), Some(100));

        player.play(0.0).unwrap();
        assert!(player.preview(ChannelId::L0, 10.0).is_err());
        player.stop().unwrap();
    }

    #[test]
    fn sync_publishes_the_clock() {
        let (mut player, _transport) = player_with_device();
        player.publish_clock(0.0, 0.0);
        player.sync(1_234.0);
        assert_eq!(player.clock().read().time_ms, 1_234.0);
    }

    #[test]
    fn config_changes_apply_while_playing() {
        let (mut player, _transport) = player_with_device();
        player.play(0.0).unwrap();
        let config = PlayerConfig {
            tick_rate_hz: 120.0,
            delay_offset_ms: 20.0,
            ..Default::default()
        };
        player.apply_config(config);
        assert_eq!(player.config().tick_rate_hz, 120.0);
        thread::sleep(Duration::from_millis(50));
        player.stop().unwrap();
    }

    #[test]
    fn close_port_stops_playback() {
        let (mut player, _transport) = player_with_device();
        player.play(0.0).unwrap();
        player.close_port().unwrap();
        assert!(!player.is_playing());
        assert!(!player.is_port_open());
        assert!(player.play(0.0).is_err());
    }
}

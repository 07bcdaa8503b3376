// src/tcode/producer_set.rs

//! All channels and their producers
//!
//! [`ProducerSet`] owns one (Channel, ChannelProducer) pair per T-Code axis,
//! assigns tracks to channels by name, and fans `sync`/`tick` out to all of
//! them at once.

use log::{debug, info};
use serde::Serialize;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use super::channel::{Channel, ChannelId, ChannelSettings, Command, Easing};
use super::funscript_utils::Track;
use super::producer::{ChannelProducer, TickPolicy, TrackBinding};

#[derive(Debug, Clone)]
pub struct ChannelSlot {
    pub channel: Channel,
    pub producer: ChannelProducer,
}

#[derive(Debug, Clone)]
pub struct ProducerSet {
    slots: Vec<ChannelSlot>,
    tracks: Vec<Weak<Track>>,
}

impl Default for ProducerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ProducerSet {
    pub fn new() -> Self {
        Self {
            slots: ChannelId::ALL
                .iter()
                .map(|&id| ChannelSlot {
                    channel: Channel::new(id),
                    producer: ChannelProducer::new(id),
                })
                .collect(),
            tracks: Vec::new(),
        }
    }

    pub fn slots(&self) -> &[ChannelSlot] {
        &self.slots
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.slots[id.index()].channel
    }

    pub fn producer(&self, id: ChannelId) -> &ChannelProducer {
        &self.slots[id.index()].producer
    }

    /// Applies channel configuration; channels not listed keep theirs.
    pub fn set_channels<'a>(
        &mut self,
        settings: impl IntoIterator<Item = (ChannelId, &'a ChannelSettings)>,
    ) {
        for (id, settings) in settings {
            self.slots[id.index()].channel.apply_settings(*settings);
        }
    }

    /// Installs a new track list.
    ///
    /// Bindings the user chose explicitly survive when their index is still
    /// valid. Every other channel that is not disabled is matched against the
    /// track names by alias suffix; L0 falls back to the first track carrying
    /// no axis suffix at all, which is the main script of a video.
    pub fn set_tracks(&mut self, tracks: &[Arc<Track>]) {
        self.tracks = tracks.iter().map(Arc::downgrade).collect();

        for slot in &mut self.slots {
            let producer = &mut slot.producer;
            match producer.binding() {
                TrackBinding::Track(index)
                    if !producer.is_auto_assigned() && index < tracks.len() =>
                {
                    producer.bind(&tracks[index], index);
                }
                TrackBinding::Disabled => {}
                _ => producer.unbind(),
            }
        }

        for slot in &mut self.slots {
            if slot.producer.binding() != TrackBinding::Auto {
                continue;
            }
            let id = slot.producer.channel();
            if let Some(index) = tracks.iter().position(|t| id.matches_track_name(&t.name)) {
                slot.producer.bind_automatically(&tracks[index], index);
            }
        }

        let l0 = &mut self.slots[ChannelId::L0.index()].producer;
        if l0.binding() == TrackBinding::Auto {
            let main = tracks.iter().position(|t| {
                !ChannelId::ALL
                    .iter()
                    .any(|id| id.matches_track_name(&t.name))
            });
            if let Some(index) = main {
                l0.bind_automatically(&tracks[index], index);
            }
        }

        for slot in &self.slots {
            if let TrackBinding::Track(index) = slot.producer.binding() {
                info!("{} -> '{}'", slot.channel.id(), tracks[index].name);
            }
        }
    }

    /// Sets a channel's binding by hand.
    ///
    /// # Returns
    /// * `Err(String)` - The requested track index does not resolve
    pub fn set_binding(&mut self, id: ChannelId, binding: TrackBinding) -> Result<(), String> {
        let producer = &mut self.slots[id.index()].producer;
        match binding {
            TrackBinding::Auto => producer.unbind(),
            TrackBinding::Disabled => producer.disable(),
            TrackBinding::Track(index) => {
                let track = self
                    .tracks
                    .get(index)
                    .and_then(Weak::upgrade)
                    .ok_or_else(|| format!("No track at index {} for {}", index, id))?;
                producer.bind(&track, index);
            }
        }
        debug!("{} binding set to {:?}", id, binding);
        Ok(())
    }

    /// Jumps every producer to `time_ms`.
    pub fn sync(&mut self, time_ms: f64) {
        for slot in &mut self.slots {
            slot.producer.sync(time_ms);
        }
    }

    /// Advances every channel to `time_ms`.
    ///
    /// # Returns
    /// The commands produced this tick, in channel order.
    pub fn tick(&mut self, time_ms: f64, tick_rate_hz: f32, policy: &TickPolicy) -> Vec<Command> {
        let tick_ms = if tick_rate_hz > 0.0 { 1000.0 / tick_rate_hz } else { 0.0 };
        let mut commands = Vec::new();
        for slot in &mut self.slots {
            let mut slot_policy = *policy;
            if slot.channel.settings().easing != Easing::None {
                slot_policy.easing = slot.channel.settings().easing;
            }
            if let Some(position) = slot.producer.tick(time_ms, tick_rate_hz, &slot_policy) {
                if let Some(command) = slot.channel.compute_command(position, tick_ms) {
                    commands.push(command);
                }
            }
        }
        commands
    }

    /// Computes a command for a position given by hand, outside any track.
    ///
    /// A preview is a single write with nothing following it, so it goes
    /// straight to the target instead of being step-limited.
    pub fn preview(&mut self, id: ChannelId, position: f32) -> Option<Command> {
        let channel = &mut self.slots[id.index()].channel;
        if channel.last_emitted() == Some(channel.device_value(position)) {
            return None;
        }
        channel.reset();
        channel.compute_command(position, 0.0)
    }

    /// Unbinds every producer and resets every channel.
    pub fn clear(&mut self) {
        self.tracks.clear();
        for slot in &mut self.slots {
            slot.producer.unbind();
            slot.channel.reset();
        }
    }
}

const UNSET_VALUE: i32 = i32::MIN;

/// Lock-free mirror of each channel's binding and last emitted value.
///
/// Written by whichever thread currently owns the [`ProducerSet`]; read by
/// anyone for display.
#[derive(Debug)]
pub struct ChannelMonitor {
    bindings: [AtomicI64; 9],
    emitted: [AtomicI32; 9],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub channel: ChannelId,
    pub binding: TrackBinding,
    pub last_value: Option<i32>,
}

impl Default for ChannelMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelMonitor {
    pub fn new() -> Self {
        Self {
            bindings: std::array::from_fn(|_| AtomicI64::new(TrackBinding::AUTO_INDEX)),
            emitted: std::array::from_fn(|_| AtomicI32::new(UNSET_VALUE)),
        }
    }

    pub fn record_commands(&self, commands: &[Command]) {
        for command in commands {
            self.emitted[command.channel.index()].store(command.value, Ordering::Relaxed);
        }
    }

    /// Copies bindings and last values out of `producers`.
    pub fn refresh(&self, producers: &ProducerSet) {
        for slot in producers.slots() {
            let index = slot.channel.id().index();
            self.bindings[index].store(slot.producer.binding().as_index(), Ordering::Relaxed);
            self.emitted[index].store(
                slot.channel.last_emitted().unwrap_or(UNSET_VALUE),
                Ordering::Relaxed,
            );
        }
    }

    pub fn last_value(&self, id: ChannelId) -> Option<i32> {
        match self.emitted[id.index()].load(Ordering::Relaxed) {
            UNSET_VALUE => None,
            value => Some(value),
        }
    }

    pub fn binding(&self, id: ChannelId) -> TrackBinding {
        TrackBinding::from_index(self.bindings[id.index()].load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> Vec<ChannelStatus> {
        ChannelId::ALL
            .iter()
            .map(|&channel| ChannelStatus {
                channel,
                binding: self.binding(channel),
                last_value: self.last_value(channel),
            })
            .collect()
    }
}

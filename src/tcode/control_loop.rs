// src/tcode/control_loop.rs

//! Real-time control loop
//!
//! The loop runs on its own thread at a fixed tick rate. Each tick it:
//!
//! 1. Reads the external clock from the [`ClockHandoff`]
//! 2. Advances its local play time and reconciles it with the external clock,
//!    nudging small drift away and resyncing outright on large jumps
//! 3. Ticks the [`ProducerSet`] and writes the resulting frame to the transport
//! 4. Sleeps, then spins, until the next tick is due
//!
//! The loop owns the transport and the producers while it runs. Everything
//! else reaches it through a non-blocking command queue, and both are handed
//! back when it stops.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use super::channel::{format_frame, ChannelId, ChannelSettings};
use super::clock::{ClockHandoff, ClockReading};
use super::funscript_utils::Track;
use super::producer::{TickPolicy, TrackBinding};
use super::producer_set::{ChannelMonitor, ProducerSet};
use super::telemetry::TickTelemetry;
use super::transport::Transport;

/// Error beyond which local time is snapped to the external clock.
pub const GROSS_DESYNC_MS: f64 = 1000.0;
/// Error below which no correction happens.
pub const DRIFT_TOLERANCE_MS: f64 = 5.0;
/// Fraction of the error removed per tick while drifting.
pub const DRIFT_CORRECTION: f64 = 0.1;

/// Remaining time under which the loop spins instead of sleeping.
const SPIN_MARGIN: Duration = Duration::from_millis(2);
const TELEMETRY_INTERVAL: Duration = Duration::from_secs(5);
const WRITE_ERROR_LOG_EVERY: u64 = 100;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    StopRequested = 3,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Starting,
            2 => LoopState::Running,
            3 => LoopState::StopRequested,
            _ => LoopState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub tick_rate_hz: f32,
    pub delay_offset_ms: f64,
    pub policy: TickPolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60.0,
            delay_offset_ms: 0.0,
            policy: TickPolicy::default(),
        }
    }
}

impl LoopSettings {
    pub fn tick_interval_ms(&self) -> f64 {
        1000.0 / self.tick_rate_hz.max(1.0) as f64
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.tick_interval_ms() / 1000.0)
    }
}

/// Changes delivered to a running loop.
#[derive(Debug, Clone)]
pub enum LoopCommand {
    SetTracks(Vec<Arc<Track>>),
    SetBinding(ChannelId, TrackBinding),
    SetChannel(ChannelId, ChannelSettings),
    SetSettings(LoopSettings),
    /// Jump to this external time without stopping.
    Resync(f64),
}

/// What the loop thread owns while running.
pub struct LoopParts {
    pub transport: Box<dyn Transport>,
    pub producers: ProducerSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAdjustment {
    InSync,
    Nudged,
    Resynced,
}

/// Local play time, reconciled against the external clock every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayClock {
    local_time_ms: f64,
    delay_offset_ms: f64,
}

impl PlayClock {
    /// Starts the local clock aligned with `external_time_ms`.
    pub fn new(external_time_ms: f64, delay_offset_ms: f64) -> Self {
        Self {
            local_time_ms: external_time_ms - delay_offset_ms,
            delay_offset_ms,
        }
    }

    pub fn local_time_ms(&self) -> f64 {
        self.local_time_ms
    }

    pub fn set_delay_offset(&mut self, delay_offset_ms: f64) {
        self.delay_offset_ms = delay_offset_ms;
    }

    pub fn snap(&mut self, external_time_ms: f64) {
        self.local_time_ms = external_time_ms - self.delay_offset_ms;
    }

    /// Positive when local time runs ahead of the external clock.
    pub fn error_ms(&self, reading: &ClockReading) -> f64 {
        self.local_time_ms - (reading.time_ms - self.delay_offset_ms)
    }

    /// Moves local time forward by `elapsed_ms` of wall time, then reconciles.
    pub fn advance(&mut self, elapsed_ms: f64, reading: ClockReading) -> ClockAdjustment {
        self.local_time_ms += elapsed_ms * reading.speed;

        let error = self.error_ms(&reading);
        if error.abs() > GROSS_DESYNC_MS {
            self.snap(reading.time_ms);
            ClockAdjustment::Resynced
        } else if error.abs() > DRIFT_TOLERANCE_MS {
            self.local_time_ms -= error * DRIFT_CORRECTION;
            ClockAdjustment::Nudged
        } else {
            ClockAdjustment::InSync
        }
    }
}

pub struct ControlLoop {
    state: Arc<AtomicU8>,
    commands: Sender<LoopCommand>,
    done: Receiver<()>,
    monitor: Arc<ChannelMonitor>,
    handle: Option<JoinHandle<LoopParts>>,
    thread_id: ThreadId,
}

impl ControlLoop {
    /// Syncs the producers to `initial_time_ms` and spawns the loop thread.
    ///
    /// # Arguments
    /// * `parts` - Transport and producers, owned by the thread until stopped
    /// * `clock` - Handoff the external clock is published to
    /// * `monitor` - Mirror updated with bindings and emitted values
    /// * `settings` - Tick rate, delay offset and interpolation policy
    /// * `initial_time_ms` - External time playback starts at
    ///
    /// # Returns
    /// * `Err(String)` - The thread could not be spawned; `parts` are lost
    pub fn start(
        mut parts: LoopParts,
        clock: Arc<ClockHandoff>,
        monitor: Arc<ChannelMonitor>,
        settings: LoopSettings,
        initial_time_ms: f64,
    ) -> Result<Self, String> {
        let state = Arc::new(AtomicU8::new(LoopState::Starting as u8));
        let play_clock = PlayClock::new(initial_time_ms, settings.delay_offset_ms);
        parts.producers.sync(play_clock.local_time_ms());
        monitor.refresh(&parts.producers);

        let (command_tx, command_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        let worker = LoopWorker::new(
            parts,
            clock,
            Arc::clone(&monitor),
            command_rx,
            Arc::clone(&state),
            settings,
            play_clock,
        );

        let handle = thread::Builder::new()
            .name("tcode-loop".into())
            .spawn(move || worker.run(done_tx))
            .map_err(|e| format!("Failed to spawn control loop thread: {}", e))?;
        let thread_id = handle.thread().id();

        Ok(Self {
            state,
            commands: command_tx,
            done: done_rx,
            monitor,
            handle: Some(handle),
            thread_id,
        })
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Queues a command for the next tick. Never blocks.
    pub fn send(&self, command: LoopCommand) {
        if self.commands.send(command).is_err() {
            warn!("Control loop is gone, dropping command");
        }
    }

    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stops the loop and waits for the thread to exit.
    ///
    /// The current tick is finished first. The producers are cleared before
    /// the parts are handed back.
    ///
    /// # Returns
    /// * `Ok(LoopParts)` - Transport and producers, back in the caller's hands
    /// * `Err(String)` - Called from the loop thread, already stopped, or the thread panicked
    pub fn stop(&mut self) -> Result<LoopParts, String> {
        if self.is_loop_thread() {
            return Err("stop() must not be called from the control loop thread".to_string());
        }
        let handle = self
            .handle
            .take()
            .ok_or_else(|| "Control loop already stopped".to_string())?;

        self.state
            .store(LoopState::StopRequested as u8, Ordering::Release);
        // Err only means the thread died without signalling; join tells us why
        let _ = self.done.recv();
        let joined = handle.join();
        self.state.store(LoopState::Stopped as u8, Ordering::Release);

        let mut parts = joined.map_err(|_| "Control loop thread panicked".to_string())?;
        parts.producers.clear();
        self.monitor.refresh(&parts.producers);
        Ok(parts)
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        if self.handle.is_some() && !self.is_loop_thread() {
            if let Err(e) = self.stop() {
                error!("Failed to stop control loop: {}", e);
            }
        }
    }
}

struct LoopWorker {
    parts: LoopParts,
    clock: Arc<ClockHandoff>,
    monitor: Arc<ChannelMonitor>,
    commands: Receiver<LoopCommand>,
    state: Arc<AtomicU8>,
    settings: LoopSettings,
    play_clock: PlayClock,
    telemetry: TickTelemetry,
    last_tick: Instant,
    last_telemetry: Instant,
}

impl LoopWorker {
    fn new(
        parts: LoopParts,
        clock: Arc<ClockHandoff>,
        monitor: Arc<ChannelMonitor>,
        commands: Receiver<LoopCommand>,
        state: Arc<AtomicU8>,
        settings: LoopSettings,
        play_clock: PlayClock,
    ) -> Self {
        let now = Instant::now();
        Self {
            parts,
            clock,
            monitor,
            commands,
            state,
            settings,
            play_clock,
            telemetry: TickTelemetry::new(),
            last_tick: now,
            last_telemetry: now,
        }
    }

    fn run(mut self, done: Sender<()>) -> LoopParts {
        // A stop requested before the thread got here must not be overwritten
        let _ = self.state.compare_exchange(
            LoopState::Starting as u8,
            LoopState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(
            "Control loop running at {} Hz on {} from {:.0} ms",
            self.settings.tick_rate_hz,
            self.parts.transport.describe(),
            self.play_clock.local_time_ms()
        );

        self.last_tick = Instant::now();
        while LoopState::from_u8(self.state.load(Ordering::Acquire)) != LoopState::StopRequested {
            let tick_start = Instant::now();
            self.drain_commands();
            self.tick(tick_start);

            let interval = self.settings.tick_interval();
            self.telemetry.record(tick_start.elapsed(), interval);
            self.log_telemetry(tick_start);
            wait_until(tick_start + interval);
        }

        info!(
            "Control loop stopped at {:.0} ms",
            self.play_clock.local_time_ms()
        );
        let _ = done.send(());
        self.parts
    }

    fn drain_commands(&mut self) {
        let mut changed = false;
        while let Ok(command) = self.commands.try_recv() {
            changed = true;
            match command {
                LoopCommand::SetTracks(tracks) => self.parts.producers.set_tracks(&tracks),
                LoopCommand::SetBinding(id, binding) => {
                    if let Err(e) = self.parts.producers.set_binding(id, binding) {
                        warn!("{}", e);
                    }
                }
                LoopCommand::SetChannel(id, settings) => {
                    self.parts.producers.set_channels([(id, &settings)]);
                }
                LoopCommand::SetSettings(settings) => {
                    self.play_clock.set_delay_offset(settings.delay_offset_ms);
                    self.settings = settings;
                }
                LoopCommand::Resync(time_ms) => {
                    self.play_clock.snap(time_ms);
                    self.parts.producers.sync(self.play_clock.local_time_ms());
                    debug!("Resynced to {:.0} ms on request", time_ms);
                }
            }
        }
        if changed {
            self.monitor.refresh(&self.parts.producers);
        }
    }

    fn tick(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_tick).as_secs_f64() * 1000.0;
        self.last_tick = now;

        let reading = self.clock.read_at(now);
        if self.play_clock.advance(elapsed_ms, reading) == ClockAdjustment::Resynced {
            debug!(
                "External clock jumped to {:.0} ms, resyncing producers",
                reading.time_ms
            );
            self.parts.producers.sync(self.play_clock.local_time_ms());
        }

        let commands = self.parts.producers.tick(
            self.play_clock.local_time_ms(),
            self.settings.tick_rate_hz,
            &self.settings.policy,
        );
        self.monitor.record_commands(&commands);

        if let Some(frame) = format_frame(&commands) {
            if let Err(e) = self.parts.transport.write_frame(frame.as_bytes()) {
                let failures = self.telemetry.record_write_error();
                if failures == 1 || failures % WRITE_ERROR_LOG_EVERY == 0 {
                    error!(
                        "Failed to write T-Code frame to {} ({} failures): {}",
                        self.parts.transport.describe(),
                        failures,
                        e
                    );
                }
            }
        }
    }

    fn log_telemetry(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_telemetry) < TELEMETRY_INTERVAL {
            return;
        }
        self.last_telemetry = now;
        let summary = self.telemetry.take_summary();
        debug!(
            "{} ticks, avg {}us max {}us, {} overruns, {} write errors",
            summary.ticks, summary.avg_us, summary.max_us, summary.overruns, summary.write_errors
        );
    }
}

/// Sleeps coarsely, then spins for the last stretch before `deadline`.
fn wait_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > SPIN_MARGIN {
            thread::sleep(remaining - SPIN_MARGIN);
        } else {
            std::hint::spin_loop();
        }
    }
}

// src/lib.rs

//! # T-Code Player
//!
//! A web application that drives a T-Code motion device in lockstep with a
//! video playing in the browser. Features include:
//!
//! - Funscript loading, including multi-axis sibling scripts
//! - Real-time control loop with drift correction against the video clock
//! - Per-channel limits, inversion, easing and jitter protection
//! - Serial output, or stdout for dry runs
//!
//! ## Architecture
//!
//! The application is split into several modules:
//!
//! - `routes`: HTTP routing configuration
//! - `handlers`: Request handlers for funscripts, configuration, channels and the device
//! - `tcode_socket`: WebSocket handler receiving the video clock and playback commands
//! - `config`: Player configuration from file and environment
//! - `tcode`: Tracks, channels, producers and the control loop

pub mod config;
pub mod routes;
pub mod handlers {
    pub mod channels;
    pub mod config;
    pub mod device;
    pub mod funscript;
    pub mod types;
}

pub mod tcode_socket;

/// T-Code output: track interpolation, channel mapping and the real-time loop
pub mod tcode {
    pub mod channel;
    pub mod clock;
    pub mod control_loop;
    pub mod funscript_utils;
    pub mod player;
    pub mod producer;
    pub mod producer_set;
    pub mod telemetry;
    pub mod transport;
}

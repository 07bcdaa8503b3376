// src/handlers/types.rs

use serde::{Deserialize, Serialize};
use crate::tcode::{
    channel::ChannelId,
    funscript_utils::Track,
    producer_set::ChannelStatus,
};

/// Summary of one loaded track
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TrackSummary {
    pub index: usize,
    pub name: String,
    pub keyframes: usize,
    /// Timestamp of the last keyframe
    pub duration_ms: i64,
}

impl TrackSummary {
    pub fn new(index: usize, track: &Track) -> Self {
        Self {
            index,
            name: track.name.clone(),
            keyframes: track.len(),
            duration_ms: track.keyframes.last().map_or(0, |k| k.at),
        }
    }
}

/// Response structure for funscript requests: the tracks handed to the player
/// and the channel bindings that resulted
#[derive(Serialize, Debug)]
pub struct FunscriptResponse {
    pub tracks: Vec<TrackSummary>,
    pub channels: Vec<ChannelStatus>,
}

/// Body of `POST /site/device/open`; an absent port means the configured one
#[derive(Deserialize, Debug, Default)]
pub struct OpenPortRequest {
    pub port: Option<String>,
}

/// Body of `POST /site/channels/{id}/preview`
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct PreviewRequest {
    pub position: f32,
}

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

#[derive(Serialize, Debug)]
pub struct PreviewResponse {
    pub channel: ChannelId,
    pub frame: Option<String>,
}

//! Events emitted over the controller's broadcast channels.
//!
//! | Event | Channel |
//! |-------|---------|
//! | [`StateChangeEvent`] | state transitions |
//! | [`VolumeEvent`] | one per processed chunk (live level meter) |
//! | [`ErrorEvent`] | failures that force the `error` state |
//!
//! Field names are camelCase and enum variants lowercase on the wire so a JS
//! front end can consume them untranslated.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, for event timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The cycle controller's state. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    /// Resting state — no capture, no playback.
    Ready,
    /// Capturing, waiting for the first voiced chunk.
    Listening,
    /// Capturing and buffering voiced audio.
    Recording,
    /// Playing the buffer back while still capturing (interruptible).
    Playing,
    /// Unrecoverable failure — an explicit reset is required.
    Error,
}

/// Emitted on every state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub old_state: CycleState,
    pub new_state: CycleState,
    pub timestamp_ms: u64,
    /// Total buffered audio at the moment of transition.
    pub buffer_duration_seconds: f64,
    pub buffer_sample_count: usize,
    pub is_capturing: bool,
    pub is_playing: bool,
}

/// Emitted for every processed chunk, independent of silence classification.
///
/// Serialize-only: the front end consumes these but never sends them back,
/// and the `null` that digital silence produces has no `f32` representation.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Linear RMS level of the chunk in [0.0, 1.0].
    pub rms: f32,
    /// Level in decibels. Serializes as `null` for digital silence (`-inf`).
    pub volume_db: f32,
    pub is_silent: bool,
    pub timestamp_ms: u64,
}

/// Machine-checkable category for an [`ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Capture or playback device setup failed.
    Initialization,
    /// Capture could not start or died once initialized.
    Recording,
    /// Failure while re-arming the listening phase.
    Listening,
    /// Sink failed to start or play.
    Playback,
}

/// Emitted when a failure forces the controller into [`CycleState::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    /// Human-readable description suitable for direct display.
    pub message: String,
    pub timestamp_ms: u64,
}

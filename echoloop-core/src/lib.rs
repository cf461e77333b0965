//! # echoloop-core
//!
//! Hands-free vocal-practice loop: sing or speak a phrase, hear it played
//! straight back, repeat.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → cycle loop (spawn_blocking)
//!                                                    │
//!                                            SilenceAnalyzer
//!                                                    │
//!                            RecordingBuffer ── sustained silence / full
//!                                                    │
//!                                         PlaybackSink (worker thread)
//!                                                    │
//!                              broadcast::Sender<StateChangeEvent / VolumeEvent>
//! ```
//!
//! The audio callback is zero-alloc. All heap work happens on the cycle
//! thread. Capture never pauses — even during playback chunks keep flowing
//! through the analyzer, which is what lets a voiced chunk interrupt playback
//! and immediately start the next take.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod analysis;
pub mod audio;
pub mod buffering;
pub mod controller;
pub mod error;
pub mod ipc;

// Convenience re-exports for downstream crates
pub use analysis::{AnalysisResult, SilenceAnalyzer};
pub use audio::playback::{PlaybackEvent, PlaybackSink};
pub use buffering::RecordingBuffer;
pub use controller::{CycleConfig, CycleController, SettingsUpdate};
pub use error::EchoError;
pub use ipc::events::{CycleState, ErrorEvent, ErrorKind, StateChangeEvent, VolumeEvent};

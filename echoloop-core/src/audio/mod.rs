//! Microphone capture via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate, block on a lock, or perform I/O. The callback
//! therefore only downmixes into a pre-grown scratch buffer and writes into
//! the lock-free SPSC ring producer.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` must be created and dropped on the same thread; the
//! controller does both inside one `spawn_blocking` closure.

pub mod playback;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{error, info, warn};

use crate::{
    buffering::{AudioProducer, Producer},
    error::{EchoError, Result},
};

/// Handle to an active microphone stream.
///
/// **Not `Send`** — bound to its creation thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: cpal::Stream,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
}

/// Average interleaved frames down to mono into `out`.
///
/// `out` is resized to the frame count; resizing is amortised to a no-op
/// after the first callback because cpal keeps its buffer size stable.
#[cfg(feature = "audio-cpal")]
fn downmix_into<S: Copy>(out: &mut Vec<f32>, data: &[S], channels: usize, to_f32: impl Fn(S) -> f32) {
    let frames = data.len() / channels;
    out.resize(frames, 0.0);
    for (frame_idx, frame) in data.chunks_exact(channels).enumerate() {
        let mut sum = 0f32;
        for &sample in frame {
            sum += to_f32(sample);
        }
        out[frame_idx] = sum / channels as f32;
    }
}

impl AudioCapture {
    /// Open the system default microphone and push mono f32 frames into
    /// `producer` at the device's native rate.
    ///
    /// Must be called from the thread that will also drop this value.
    ///
    /// # Errors
    /// `EchoError::NoDefaultInputDevice` when no microphone is available, or
    /// `EchoError::AudioDevice` / `EchoError::AudioStream` when cpal fails to
    /// configure or build the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(mut producer: AudioProducer, running: Arc<AtomicBool>) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(EchoError::NoDefaultInputDevice)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| EchoError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ch = channels as usize;
        let running_f32 = Arc::clone(&running);
        let running_i16 = Arc::clone(&running);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let mut mono: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running_f32.load(Ordering::Relaxed) {
                            return;
                        }
                        if ch == 1 {
                            let written = producer.push_slice(data);
                            if written < data.len() {
                                warn!("ring buffer full: dropped {} frames", data.len() - written);
                            }
                            return;
                        }
                        downmix_into(&mut mono, data, ch, |s| s);
                        let written = producer.push_slice(&mono);
                        if written < mono.len() {
                            warn!("ring buffer full: dropped {} frames", mono.len() - written);
                        }
                    },
                    |err| error!("capture stream error: {err}"),
                    None,
                )
            }

            SampleFormat::I16 => {
                let mut mono: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running_i16.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix_into(&mut mono, data, ch, |s| s as f32 / 32_768.0);
                        let written = producer.push_slice(&mono);
                        if written < mono.len() {
                            warn!("ring buffer full: dropped {} frames", mono.len() - written);
                        }
                    },
                    |err| error!("capture stream error: {err}"),
                    None,
                )
            }

            fmt => {
                return Err(EchoError::AudioStream(format!(
                    "unsupported capture sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| EchoError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| EchoError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
        })
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_default(_producer: AudioProducer, _running: Arc<AtomicBool>) -> Result<Self> {
        Err(EchoError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

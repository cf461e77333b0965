//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Recordings are buffered at the capture device's native rate, but the
//! output device frequently runs at a different one (44.1 kHz headphones
//! against a 48 kHz microphone is common). [`RateConverter`] bridges that gap
//! on the playback worker thread before the clip is handed to the output
//! stream.
//!
//! When the rates already match, the converter is a plain passthrough and no
//! rubato session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{EchoError, Result};

/// Input frame count per rubato call.
const CONVERT_BLOCK: usize = 1_024;

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input blocks between calls.
    pending: Vec<f32>,
    /// Pre-allocated rubato output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// Returns `EchoError::Playback` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                output_buf: Vec::new(),
            });
        }

        let ratio = target_rate as f64 / source_rate as f64;
        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio — no dynamic adjustment
            PolynomialDegree::Cubic,
            CONVERT_BLOCK,
            1, // mono
        )
        .map_err(|e| EchoError::Playback(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            output_buf: vec![vec![0f32; max_out]; 1],
        })
    }

    /// Feed samples through, returning whatever full blocks produced.
    ///
    /// Input shorter than a block is held back until enough has accumulated.
    /// In passthrough mode the input is returned directly.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        while self.pending.len() >= CONVERT_BLOCK {
            let block = &self.pending[..CONVERT_BLOCK];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    out.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..CONVERT_BLOCK);
        }
        out
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// One-shot conversion of a whole clip.
///
/// The tail is zero-padded up to a full block so no audible audio is lost at
/// the end of the recording.
///
/// # Errors
/// Propagates converter initialisation failure.
pub fn convert_clip(source_rate: u32, target_rate: u32, samples: &[f32]) -> Result<Vec<f32>> {
    let mut converter = RateConverter::new(source_rate, target_rate)?;
    if converter.is_passthrough() {
        return Ok(samples.to_vec());
    }

    let mut out = converter.process(samples);
    let remainder = samples.len() % CONVERT_BLOCK;
    if remainder > 0 {
        let pad = vec![0f32; CONVERT_BLOCK - remainder];
        out.extend_from_slice(&converter.process(&pad));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(48_000, 48_000).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn partial_block_is_held_back() {
        let mut rc = RateConverter::new(48_000, 44_100).unwrap();
        assert!(!rc.is_passthrough());
        let out = rc.process(&vec![0.0f32; 500]);
        assert!(out.is_empty(), "expected empty output, got {}", out.len());
    }

    #[test]
    fn downsampling_halves_the_length() {
        let mut rc = RateConverter::new(48_000, 24_000).unwrap();
        // 4 full blocks in → roughly half as many samples out
        let out = rc.process(&vec![0.0f32; CONVERT_BLOCK * 4]);
        let expected = CONVERT_BLOCK * 2;
        assert!(
            (out.len() as isize - expected as isize).unsigned_abs() <= 32,
            "output len={} expected≈{}",
            out.len(),
            expected
        );
    }

    #[test]
    fn convert_clip_covers_the_tail() {
        // A clip that is not a multiple of the block size must not lose its
        // tail: the output should cover the full input duration.
        let input_len = CONVERT_BLOCK * 3 + 700;
        let out = convert_clip(48_000, 16_000, &vec![0.1f32; input_len]).unwrap();
        let expected = input_len / 3;
        assert!(
            out.len() >= expected.saturating_sub(64),
            "output len={} expected≥{}",
            out.len(),
            expected - 64
        );
    }

    #[test]
    fn convert_clip_passthrough_copies_input() {
        let samples: Vec<f32> = (0..100).map(|i| i as f32 * 0.01).collect();
        let out = convert_clip(16_000, 16_000, &samples).unwrap();
        assert_eq!(out, samples);
    }
}

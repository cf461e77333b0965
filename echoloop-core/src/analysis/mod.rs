//! Silence/volume analysis of incoming audio chunks.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the chunk, convert to decibels
//!    (`20 * log10(rms)`, `-inf` for digital silence).
//! 2. Classify silent when the dB level is below the configured threshold.
//! 3. Accumulate the length of the current silence run from chunk durations;
//!    when the run reaches the configured silence duration, emit exactly one
//!    [`SilenceEvent`] and restart the run clock. Continued silence therefore
//!    fires again only after another full duration, never once per chunk.

use std::time::{Duration, Instant};

use crate::buffering::chunk::AudioChunk;

/// Default classification threshold. Matches a quiet room on a typical
/// consumer microphone; the UI exposes a [-70, -20] dB range.
pub const DEFAULT_VOLUME_THRESHOLD_DB: f32 = -50.0;

/// Default sustained-silence duration before a [`SilenceEvent`] fires.
pub const DEFAULT_SILENCE_DURATION: Duration = Duration::from_millis(500);

/// Per-chunk volume reading and silence classification.
///
/// Ephemeral — recomputed for every chunk and consumed immediately by the
/// cycle loop.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisResult {
    /// Linear RMS level, ≥ 0.
    pub rms: f32,
    /// RMS in decibels; `f32::NEG_INFINITY` when the chunk is all zeros.
    pub volume_db: f32,
    /// Whether `volume_db` is below the configured threshold.
    pub is_silent: bool,
    pub at: Instant,
}

/// Fired when an uninterrupted silence run reaches the configured duration.
#[derive(Debug, Clone, Copy)]
pub struct SilenceEvent {
    /// Accumulated length of the run when it fired.
    pub silence: Duration,
    pub at: Instant,
    /// The analysis result of the chunk that tipped the run over.
    pub result: AnalysisResult,
}

/// Stateful per-chunk silence classifier and run tracker.
#[derive(Debug, Clone)]
pub struct SilenceAnalyzer {
    threshold_db: f32,
    silence_duration: Duration,
    /// Whether the previous chunk was classified silent.
    in_silence: bool,
    /// Accumulated duration of the current silence run.
    run: Duration,
}

impl SilenceAnalyzer {
    pub fn new(threshold_db: f32, silence_duration: Duration) -> Self {
        Self {
            threshold_db,
            silence_duration,
            in_silence: false,
            run: Duration::ZERO,
        }
    }

    /// Analyze one chunk and advance the silence-run clock.
    ///
    /// An empty chunk carries no volume information and is a no-op for the
    /// run clock: the result reports zero RMS but the run state is untouched.
    pub fn analyze(&mut self, chunk: &AudioChunk) -> (AnalysisResult, Option<SilenceEvent>) {
        let at = Instant::now();

        if chunk.is_empty() {
            let result = AnalysisResult {
                rms: 0.0,
                volume_db: f32::NEG_INFINITY,
                is_silent: true,
                at,
            };
            return (result, None);
        }

        let rms = Self::rms(&chunk.samples);
        let volume_db = amplitude_to_db(rms);
        let is_silent = volume_db < self.threshold_db;
        let result = AnalysisResult {
            rms,
            volume_db,
            is_silent,
            at,
        };

        let event = if is_silent {
            if !self.in_silence {
                self.in_silence = true;
                self.run = Duration::ZERO;
            }
            self.run += Duration::from_secs_f64(chunk.duration_secs());
            if self.run >= self.silence_duration {
                let event = SilenceEvent {
                    silence: self.run,
                    at,
                    result,
                };
                // Restart so continued silence re-fires only after another
                // full configured duration.
                self.run = Duration::ZERO;
                Some(event)
            } else {
                None
            }
        } else {
            self.in_silence = false;
            self.run = Duration::ZERO;
            None
        };

        (result, event)
    }

    /// Replace threshold and duration atomically. An in-flight silence run
    /// keeps its accumulated time; only future comparisons change.
    pub fn update_settings(&mut self, threshold_db: f32, silence_duration: Duration) {
        self.threshold_db = threshold_db;
        self.silence_duration = silence_duration;
    }

    /// Clear the silent flag and run clock. Called whenever a new listening
    /// phase begins so a stale run cannot fire into fresh audio.
    pub fn reset(&mut self) {
        self.in_silence = false;
        self.run = Duration::ZERO;
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }

    pub fn silence_duration(&self) -> Duration {
        self.silence_duration
    }

    fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl Default for SilenceAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_VOLUME_THRESHOLD_DB, DEFAULT_SILENCE_DURATION)
    }
}

/// Convert a linear amplitude to decibels. Zero maps to `-inf`.
pub fn amplitude_to_db(amplitude: f32) -> f32 {
    if amplitude == 0.0 {
        f32::NEG_INFINITY
    } else {
        20.0 * amplitude.log10()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// 100 ms of constant samples at 16 kHz.
    fn chunk(value: f32) -> AudioChunk {
        AudioChunk::new(vec![value; 1_600], 16_000)
    }

    #[test]
    fn zero_amplitude_is_negative_infinity_db() {
        assert_eq!(amplitude_to_db(0.0), f32::NEG_INFINITY);
    }

    #[test]
    fn full_scale_amplitude_is_zero_db() {
        assert_relative_eq!(amplitude_to_db(1.0), 0.0);
    }

    #[test]
    fn db_conversion_is_monotonic() {
        let levels = [0.001f32, 0.01, 0.1, 0.5, 1.0];
        for pair in levels.windows(2) {
            assert!(amplitude_to_db(pair[0]) < amplitude_to_db(pair[1]));
        }
    }

    #[test]
    fn rms_of_square_wave_is_its_amplitude() {
        let samples: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        assert_relative_eq!(SilenceAnalyzer::rms(&samples), 0.5, epsilon = 1e-5);
    }

    #[test]
    fn classifies_against_threshold() {
        let mut analyzer = SilenceAnalyzer::new(-50.0, Duration::from_millis(500));

        let (loud, _) = analyzer.analyze(&chunk(0.5));
        assert!(!loud.is_silent);
        assert!(loud.volume_db > -50.0);

        let (quiet, _) = analyzer.analyze(&chunk(0.001));
        assert!(quiet.is_silent);
        assert!(quiet.volume_db < -50.0);
    }

    #[test]
    fn silence_event_fires_once_per_full_run() {
        // 100 ms chunks, 500 ms trigger: the 5th silent chunk fires, then
        // the 10th, not every chunk in between.
        let mut analyzer = SilenceAnalyzer::new(-50.0, Duration::from_millis(500));

        let mut fired = vec![];
        for i in 0..10 {
            let (_, event) = analyzer.analyze(&chunk(0.0001));
            if event.is_some() {
                fired.push(i);
            }
        }
        assert_eq!(fired, vec![4, 9]);
    }

    #[test]
    fn speech_clears_the_run() {
        let mut analyzer = SilenceAnalyzer::new(-50.0, Duration::from_millis(500));

        for _ in 0..4 {
            let (_, event) = analyzer.analyze(&chunk(0.0001));
            assert!(event.is_none());
        }
        // Speech resets the run: the next 4 silent chunks are not enough.
        analyzer.analyze(&chunk(0.5));
        for _ in 0..4 {
            let (_, event) = analyzer.analyze(&chunk(0.0001));
            assert!(event.is_none());
        }
        let (_, event) = analyzer.analyze(&chunk(0.0001));
        assert!(event.is_some());
    }

    #[test]
    fn event_reports_accumulated_run_length() {
        let mut analyzer = SilenceAnalyzer::new(-50.0, Duration::from_millis(450));

        let mut event = None;
        for _ in 0..5 {
            event = analyzer.analyze(&chunk(0.0001)).1;
            if event.is_some() {
                break;
            }
        }
        let event = event.expect("silence event after 500 ms of runs");
        assert_eq!(event.silence, Duration::from_millis(500));
        assert!(event.result.is_silent);
    }

    #[test]
    fn update_settings_keeps_in_flight_run() {
        let mut analyzer = SilenceAnalyzer::new(-50.0, Duration::from_millis(1_000));

        for _ in 0..4 {
            analyzer.analyze(&chunk(0.0001));
        }
        // Shorten the trigger: the 400 ms already accumulated still counts.
        analyzer.update_settings(-50.0, Duration::from_millis(500));
        let (_, event) = analyzer.analyze(&chunk(0.0001));
        assert!(event.is_some());
    }

    #[test]
    fn reset_clears_the_run() {
        let mut analyzer = SilenceAnalyzer::new(-50.0, Duration::from_millis(500));

        for _ in 0..4 {
            analyzer.analyze(&chunk(0.0001));
        }
        analyzer.reset();
        let (_, event) = analyzer.analyze(&chunk(0.0001));
        assert!(event.is_none());
    }

    #[test]
    fn empty_chunk_is_a_no_op_for_the_run() {
        let mut analyzer = SilenceAnalyzer::new(-50.0, Duration::from_millis(500));

        for _ in 0..4 {
            analyzer.analyze(&chunk(0.0001));
        }
        let (result, event) = analyzer.analyze(&AudioChunk::new(vec![], 16_000));
        assert_eq!(result.rms, 0.0);
        assert!(event.is_none());
        // The run continues where it left off.
        let (_, event) = analyzer.analyze(&chunk(0.0001));
        assert!(event.is_some());
    }
}

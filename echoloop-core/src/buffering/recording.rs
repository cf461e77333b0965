//! Bounded FIFO recording buffer with leading-silence suppression.
//!
//! ## Eviction policy
//!
//! Appends keep a running total duration. When the total exceeds the
//! configured maximum, chunks are dropped from the front until the buffer is
//! back under the limit — but at least one chunk is always retained, so a
//! single chunk longer than the maximum is kept rather than producing an
//! empty buffer.

use std::collections::VecDeque;

use tracing::debug;

use super::chunk::AudioChunk;

/// Default cap on buffered audio: 5 minutes.
pub const DEFAULT_MAX_DURATION_SECS: f64 = 300.0;

/// Ordered chunk store feeding playback.
#[derive(Debug)]
pub struct RecordingBuffer {
    chunks: VecDeque<AudioChunk>,
    /// Running total of chunk durations, maintained incrementally.
    total_secs: f64,
    max_secs: f64,
    /// While set, silent chunks are dropped until the first voiced chunk of
    /// this buffer generation arrives.
    discard_leading_silence: bool,
    voiced_seen: bool,
    /// Latched when an append pushed the pre-eviction total to the maximum.
    /// Eviction keeps the running total under the limit afterwards, so the
    /// moment of fullness has to be remembered, not recomputed.
    reached_limit: bool,
}

impl RecordingBuffer {
    pub fn new(max_secs: f64) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_secs: 0.0,
            max_secs: max_secs.max(0.0),
            discard_leading_silence: false,
            voiced_seen: false,
            reached_limit: false,
        }
    }

    /// Append a classified chunk. Returns `true` when the chunk was stored,
    /// `false` when it was suppressed as leading silence.
    ///
    /// After the call, total duration ≤ max duration unless the buffer holds
    /// exactly one oversized chunk.
    pub fn add_chunk(&mut self, chunk: AudioChunk, is_silent: bool) -> bool {
        if self.discard_leading_silence && !self.voiced_seen {
            if is_silent {
                return false;
            }
            self.voiced_seen = true;
        }

        self.total_secs += chunk.duration_secs();
        self.chunks.push_back(chunk);
        if self.total_secs >= self.max_secs {
            self.reached_limit = true;
        }

        let mut evicted = 0usize;
        while self.total_secs > self.max_secs && self.chunks.len() > 1 {
            if let Some(old) = self.chunks.pop_front() {
                self.total_secs -= old.duration_secs();
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(
                evicted,
                retained_secs = self.total_secs,
                "recording buffer over limit — evicted oldest chunks"
            );
        }
        true
    }

    /// Concatenate all retained chunks in capture order.
    pub fn all_samples(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.sample_count());
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.samples);
        }
        out
    }

    /// Drop all chunks, reset duration, and forget any voiced chunk seen.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_secs = 0.0;
        self.voiced_seen = false;
        self.reached_limit = false;
    }

    /// Whether buffered audio has reached the configured maximum since the
    /// last [`clear`](Self::clear).
    pub fn is_full(&self) -> bool {
        self.reached_limit
    }

    /// Toggle leading-silence suppression. Enabling it starts a fresh
    /// generation: the voiced-seen flag is cleared.
    pub fn set_discard_leading_silence(&mut self, discard: bool) {
        self.discard_leading_silence = discard;
        if discard {
            self.voiced_seen = false;
        }
    }

    /// Propagate a runtime max-duration change. Takes effect on the next
    /// append; already-buffered audio is not retro-evicted.
    pub fn set_max_duration_secs(&mut self, max_secs: f64) {
        self.max_secs = max_secs.max(0.0);
    }

    pub fn duration_secs(&self) -> f64 {
        self.total_secs
    }

    pub fn max_duration_secs(&self) -> f64 {
        self.max_secs
    }

    pub fn sample_count(&self) -> usize {
        self.chunks.iter().map(|c| c.samples.len()).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Default for RecordingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DURATION_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One second of constant samples at 1 kHz keeps the arithmetic obvious.
    fn chunk_secs(value: f32, secs: f64) -> AudioChunk {
        let rate = 1_000u32;
        AudioChunk::new(vec![value; (secs * rate as f64) as usize], rate)
    }

    #[test]
    fn appends_accumulate_duration_in_order() {
        let mut buf = RecordingBuffer::new(10.0);
        buf.add_chunk(chunk_secs(0.1, 1.0), false);
        buf.add_chunk(chunk_secs(0.2, 2.0), false);
        assert!((buf.duration_secs() - 3.0).abs() < 1e-9);
        assert_eq!(buf.chunk_count(), 2);
        assert_eq!(buf.sample_count(), 3_000);
    }

    #[test]
    fn all_samples_round_trips_in_capture_order() {
        let mut buf = RecordingBuffer::new(10.0);
        let a = AudioChunk::new(vec![0.1, 0.2], 1_000);
        let b = AudioChunk::new(vec![0.3, 0.4, 0.5], 1_000);
        buf.add_chunk(a.clone(), false);
        buf.add_chunk(b.clone(), false);

        let mut expected = a.samples.clone();
        expected.extend_from_slice(&b.samples);
        assert_eq!(buf.all_samples(), expected);
    }

    #[test]
    fn eviction_keeps_total_under_limit() {
        let mut buf = RecordingBuffer::new(3.0);
        for _ in 0..10 {
            buf.add_chunk(chunk_secs(0.1, 1.0), false);
            assert!(buf.duration_secs() <= 3.0 + 1e-9);
        }
        assert_eq!(buf.chunk_count(), 3);
        assert!(buf.is_full());
        buf.clear();
        assert!(!buf.is_full());
    }

    #[test]
    fn eviction_drops_oldest_first() {
        let mut buf = RecordingBuffer::new(2.0);
        buf.add_chunk(chunk_secs(0.1, 1.0), false);
        buf.add_chunk(chunk_secs(0.2, 1.0), false);
        buf.add_chunk(chunk_secs(0.3, 1.0), false);

        let samples = buf.all_samples();
        // First-appended chunk (0.1) is gone; order of the rest preserved.
        assert_eq!(samples[0], 0.2);
        assert_eq!(samples[samples.len() - 1], 0.3);
    }

    #[test]
    fn single_oversized_chunk_is_retained() {
        let mut buf = RecordingBuffer::new(1.0);
        buf.add_chunk(chunk_secs(0.1, 5.0), false);
        assert_eq!(buf.chunk_count(), 1);
        assert!((buf.duration_secs() - 5.0).abs() < 1e-9);

        // A follow-up append evicts the oversized chunk, not the new one.
        buf.add_chunk(chunk_secs(0.2, 0.5), false);
        assert_eq!(buf.chunk_count(), 1);
        assert!((buf.duration_secs() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn leading_silence_is_suppressed_until_first_voiced_chunk() {
        let mut buf = RecordingBuffer::new(10.0);
        buf.set_discard_leading_silence(true);

        assert!(!buf.add_chunk(chunk_secs(0.0, 1.0), true));
        assert!(!buf.add_chunk(chunk_secs(0.0, 1.0), true));
        assert!(!buf.add_chunk(chunk_secs(0.0, 1.0), true));
        assert!(buf.add_chunk(chunk_secs(0.5, 1.0), false));
        // Trailing silence after voiced audio is kept.
        assert!(buf.add_chunk(chunk_secs(0.0, 1.0), true));

        let samples = buf.all_samples();
        assert_eq!(samples.len(), 2_000);
        assert_eq!(samples[0], 0.5);
    }

    #[test]
    fn clear_resets_duration_and_voiced_flag() {
        let mut buf = RecordingBuffer::new(10.0);
        buf.set_discard_leading_silence(true);
        buf.add_chunk(chunk_secs(0.5, 1.0), false);
        buf.clear();

        assert!(buf.is_empty());
        assert_eq!(buf.duration_secs(), 0.0);
        // A new generation suppresses leading silence again.
        assert!(!buf.add_chunk(chunk_secs(0.0, 1.0), true));
    }

    #[test]
    fn empty_buffer_returns_empty_samples() {
        let buf = RecordingBuffer::default();
        assert!(buf.all_samples().is_empty());
        assert_eq!(buf.sample_count(), 0);
    }
}

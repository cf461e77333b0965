//! Audio buffering: the SPSC transport ring and the bounded recording buffer.
//!
//! The ring carries raw f32 samples from the real-time capture callback to
//! the cycle thread (`ringbuf::HeapRb` — wait-free `push_slice`, safe in the
//! audio callback). The [`RecordingBuffer`] lives on the cycle thread and
//! accumulates classified chunks for playback.

pub mod chunk;
pub mod recording;

use ringbuf::{traits::Split, HeapRb};

pub use recording::RecordingBuffer;
pub use ringbuf::traits::{Consumer, Producer};

/// Type alias for the producer half — held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half — held by the cycle thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Ring capacity: 2^21 = 2 097 152 f32 samples ≈ 43.7 s at 48 kHz.
/// Only covers transport jitter between the callback and the cycle loop;
/// long-form accumulation happens in [`RecordingBuffer`].
pub const RING_CAPACITY: usize = 1 << 21;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
///
/// # Panics
/// Never panics — `HeapRb` construction cannot fail for reasonable capacities.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

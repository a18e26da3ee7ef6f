//! Sample buffering primitives.
//!
//! - [`block`]: the fixed-size `AudioBlock` every component works on.
//! - [`reference`]: the playback reference ring used for echo awareness.
//! - Lock-free SPSC rings (`ringbuf::HeapRb<f32>`) whose `push_slice` is
//!   wait-free and safe to call from a real-time audio callback.

pub mod block;
pub mod reference;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by the real-time device callback.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by the worker thread that assembles blocks.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// Capture ring capacity: 2^18 = 262 144 f32 samples ≈ 5.4 s at 48 kHz.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 18;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(capacity.max(1)).split()
}

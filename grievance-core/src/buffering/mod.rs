//! Frame slicing, plus the lock-free sample ring that feeds an output device.
//!
//! The ring uses `ringbuf::HeapRb<i16>`: the playback task pushes, the
//! device callback pops, and neither side allocates or blocks.

pub mod frame;

pub use frame::{FrameGeometry, FrameSlicer, PcmFrame, TailPolicy, BYTES_PER_SAMPLE};

#[cfg(feature = "audio-cpal")]
pub use ring::{create_playback_ring, PlaybackConsumer, PlaybackProducer, RING_CAPACITY};

#[cfg(feature = "audio-cpal")]
mod ring {
    use ringbuf::{traits::Split, HeapRb};

    /// Producer half, held by the sink the playback task writes to.
    pub type PlaybackProducer = ringbuf::HeapProd<i16>;

    /// Consumer half, held by the device output callback.
    pub type PlaybackConsumer = ringbuf::HeapCons<i16>;

    /// 2^16 samples ≈ 1.4 s at 48 kHz mono. Frames are paced in real time, so
    /// the ring only has to absorb scheduling jitter.
    pub const RING_CAPACITY: usize = 1 << 16;

    pub fn create_playback_ring() -> (PlaybackProducer, PlaybackConsumer) {
        HeapRb::<i16>::new(RING_CAPACITY).split()
    }
}

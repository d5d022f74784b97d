//! Pluggable pacing strategies between the PCM producer and
//! [`crate::device::Device::send_audio`]: one `Buffer` trait, four
//! implementations, and a factory keyed by the configured algorithm. Each
//! variant composes a shared `Counters` struct rather than inheriting
//! state from a common base.

mod none;
mod poll;
mod threaded;
mod timed;

pub use none::NoneBuffer;
pub use poll::PollBuffer;
pub use threaded::ThreadedBuffer;
pub use timed::TimedBuffer;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::BufferAlgorithm;
use crate::device::Frame;

/// Ring size used by the `Poll4`/`Poll8` variants' silence-prefix rule and
/// by `Threaded`/`Timed`'s gap detection: a gap since the last `send_buffer`
/// exceeding `8 * 20ms` is treated as an empty stream.
pub const STREAM_DEPTH: std::time::Duration = std::time::Duration::from_millis(8 * 20);

/// One 20ms frame period, the pacing unit every variant reasons about.
pub const FRAME_PERIOD: std::time::Duration = std::time::Duration::from_millis(20);

/// The callback a `Buffer` delivers finished frames to. Synchronous and
/// `Send + Sync` because `ThreadedBuffer` invokes it from a plain OS thread,
/// not an async task: the delivery thread is a real kernel thread, not a
/// tokio task.
pub type DeliverFn = Arc<dyn Fn(&Frame) -> bool + Send + Sync>;

/// Counters exposed by every `Buffer` variant.
#[derive(Default)]
pub struct Counters {
    occupancy: AtomicUsize,
    high_water: AtomicUsize,
    overruns: AtomicUsize,
    failed_writes: AtomicUsize,
    silence_frames: AtomicUsize,
}

impl Counters {
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Relaxed)
    }
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
    pub fn overruns(&self) -> usize {
        self.overruns.load(Ordering::Relaxed)
    }
    pub fn failed_writes(&self) -> usize {
        self.failed_writes.load(Ordering::Relaxed)
    }
    pub fn silence_frames(&self) -> usize {
        self.silence_frames.load(Ordering::Relaxed)
    }

    fn record_occupancy(&self, occupancy: usize) {
        self.occupancy.store(occupancy, Ordering::Relaxed);
        self.high_water.fetch_max(occupancy, Ordering::Relaxed);
    }
    fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }
    fn record_failed_write(&self) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
    }
    fn record_silence(&self, n: usize) {
        self.silence_frames.fetch_add(n, Ordering::Relaxed);
    }
}

/// Pluggable pacing strategy. The producer calls `next_buffer` to get a
/// frame to fill, fills it, then calls `send_buffer`. `next_buffer`
/// returning `None` means overrun: the producer must drop the frame it
/// would have written.
pub trait Buffer: Send {
    fn next_buffer(&mut self) -> Option<&mut Frame>;
    fn send_buffer(&mut self);
    fn counters(&self) -> &Counters;
}

/// Build the configured `Buffer` variant.
pub fn create(algorithm: BufferAlgorithm, deliver: DeliverFn) -> Box<dyn Buffer> {
    match algorithm {
        BufferAlgorithm::None => Box::new(NoneBuffer::new(deliver)),
        BufferAlgorithm::Threaded => Box::new(ThreadedBuffer::new(deliver)),
        BufferAlgorithm::Poll4 => Box::new(PollBuffer::<4>::new(deliver)),
        BufferAlgorithm::Poll8 => Box::new(PollBuffer::<8>::new(deliver)),
        BufferAlgorithm::Timed => Box::new(TimedBuffer::new(deliver)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_tracks_the_maximum_occupancy_seen() {
        let counters = Counters::default();
        counters.record_occupancy(2);
        counters.record_occupancy(5);
        counters.record_occupancy(1);
        assert_eq!(counters.occupancy(), 1);
        assert_eq!(counters.high_water(), 5);
    }
}

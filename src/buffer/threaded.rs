//! Own-thread ring of 4 frames with a sleep-driven delivery loop that
//! targets one frame per 20ms boundary. This is the default algorithm: it
//! behaves best against the irregular cadence of upstream PCM producers.
//!
//! The producer (this type, used from the audio thread) and the delivery
//! thread form a single-producer/single-consumer ring. `read`/`write` are
//! plain atomics, each on its own cache line to avoid false sharing between
//! the two threads.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{Buffer, Counters, DeliverFn, FRAME_PERIOD};
use crate::device::Frame;

const RING_SIZE: usize = 4;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[repr(align(64))]
struct Aligned(AtomicUsize);

struct Shared {
    ring: [UnsafeCell<Frame>; RING_SIZE],
    read: Aligned,
    write: Aligned,
    running: AtomicBool,
    counters: Counters,
}

// SAFETY: `ring` is accessed as a single-producer/single-consumer queue.
// The producer (`ThreadedBuffer::next_buffer`/`send_buffer`, called from the
// audio thread) only ever writes slot `write & mask` before publishing it by
// advancing `write` with `Release`. The delivery thread only reads a slot
// after observing that advance with `Acquire`, and only ever writes `read`.
// No two threads touch the same slot at the same time.
unsafe impl Sync for Shared {}

pub struct ThreadedBuffer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedBuffer {
    pub fn new(deliver: DeliverFn) -> Self {
        let shared = Arc::new(Shared {
            ring: std::array::from_fn(|_| UnsafeCell::new(Frame::default())),
            read: Aligned(AtomicUsize::new(0)),
            write: Aligned(AtomicUsize::new(0)),
            running: AtomicBool::new(true),
            counters: Counters::default(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("buffer_encode".into())
            .spawn(move || delivery_loop(worker_shared, deliver))
            .expect("failed to spawn buffer delivery thread");

        ThreadedBuffer {
            shared,
            worker: Some(worker),
        }
    }
}

impl Buffer for ThreadedBuffer {
    /// `None` means the ring is full; the overrun counter is bumped and
    /// the caller must drop the frame it would have written.
    fn next_buffer(&mut self) -> Option<&mut Frame> {
        let write = self.shared.write.0.load(Ordering::Relaxed);
        let read = self.shared.read.0.load(Ordering::Acquire);
        if write - read >= RING_SIZE {
            self.shared.counters.record_overrun();
            return None;
        }
        let idx = write & (RING_SIZE - 1);
        // SAFETY: see the Shared::ring invariant above; this slot isn't
        // visible to the delivery thread until `send_buffer` advances `write`.
        Some(unsafe { &mut *self.shared.ring[idx].get() })
    }

    fn send_buffer(&mut self) {
        self.shared.write.0.fetch_add(1, Ordering::Release);
    }

    fn counters(&self) -> &Counters {
        &self.shared.counters
    }
}

impl Drop for ThreadedBuffer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn slot(shared: &Shared, idx: usize) -> &Frame {
    // SAFETY: caller only reads indices already published by the producer
    // (i.e. `< write` as last observed with Acquire).
    unsafe { &*shared.ring[idx & (RING_SIZE - 1)].get() }
}

/// Wakes every 5ms, delivers at most one frame per 20ms boundary. On an
/// empty ring it emits one silence frame; on a failed write it drops an
/// extra frame from the ring to keep the stream from drifting ahead of the
/// peripheral.
fn delivery_loop(shared: Arc<Shared>, deliver: DeliverFn) {
    let mut startup = true;
    let mut next = Instant::now() + FRAME_PERIOD;

    while shared.running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next {
            std::thread::sleep(POLL_INTERVAL.min(next - now));
            continue;
        }

        let read = shared.read.0.load(Ordering::Relaxed);
        let write = shared.write.0.load(Ordering::Acquire);
        let occupancy = write - read;
        shared.counters.record_occupancy(occupancy);

        if write > read {
            if startup {
                // Wait until the ring is at least half full before the
                // first send.
                if occupancy < RING_SIZE / 2 {
                    next += FRAME_PERIOD;
                    continue;
                }
                startup = false;
                let mut idx = read;
                while idx < write {
                    if !deliver(slot(&shared, idx)) {
                        shared.counters.record_failed_write();
                        if write > idx + 1 {
                            shared.counters.record_overrun();
                        }
                        break;
                    }
                    idx += 1;
                }
                shared.read.0.store(idx, Ordering::Release);
            } else {
                let mut advance = 1;
                if !deliver(slot(&shared, read)) {
                    shared.counters.record_failed_write();
                    if write > read + 1 {
                        advance = 2;
                        shared.counters.record_overrun();
                    }
                }
                shared.read.0.store(read + advance, Ordering::Release);
            }
        } else {
            if !deliver(&Frame::default()) {
                shared.counters.record_failed_write();
            }
            shared.counters.record_silence(1);
        }
        next += FRAME_PERIOD;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn delivers_frames_once_ring_fills_during_startup() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let delivered2 = Arc::clone(&delivered);
        let mut buf = ThreadedBuffer::new(Arc::new(move |f: &Frame| {
            delivered2.lock().unwrap().push(f.left[0]);
            true
        }));

        for i in 0..RING_SIZE {
            let frame = buf.next_buffer().expect("ring has room");
            frame.left[0] = i as i16;
            buf.send_buffer();
        }

        // Give the delivery thread a few wakeups to drain the ring.
        std::thread::sleep(Duration::from_millis(150));
        let got = delivered.lock().unwrap();
        assert_eq!(got.as_slice(), &[0, 1, 2, 3]);
    }

    #[test]
    fn overrun_is_counted_when_ring_stays_full() {
        let never_ready = Arc::new(StdAtomicUsize::new(0));
        let never_ready2 = Arc::clone(&never_ready);
        let mut buf = ThreadedBuffer::new(Arc::new(move |_: &Frame| {
            never_ready2.fetch_add(1, Ordering::Relaxed);
            false
        }));
        for _ in 0..RING_SIZE {
            buf.next_buffer().unwrap();
            buf.send_buffer();
        }
        // Ring is full and the delivery thread can't drain it (callback
        // always fails); a further request must report overrun.
        assert!(buf.next_buffer().is_none());
        assert_eq!(buf.counters().overruns(), 1);
    }
}

//! Single-threaded ring of `N` frames that drains as much as the callback
//! will accept before handing out the next write slot, with a silence
//! prefix when the producer resumes after a gap.

use std::time::Instant;

use super::{Buffer, Counters, DeliverFn, STREAM_DEPTH};
use crate::device::Frame;

/// Frames of silence flushed once the ring fills after a startup/resume gap.
const SILENCE_PREFIX: usize = 6;

pub struct PollBuffer<const N: usize> {
    ring: Vec<Frame>,
    read: usize,
    write: usize,
    startup: bool,
    last_send: Option<Instant>,
    deliver: DeliverFn,
    counters: Counters,
}

impl<const N: usize> PollBuffer<N> {
    pub fn new(deliver: DeliverFn) -> Self {
        debug_assert!(N.is_power_of_two() && N > 1, "RING_SIZE must be a power of two >= 2");
        PollBuffer {
            ring: vec![Frame::default(); N],
            read: 0,
            write: 0,
            startup: true,
            last_send: None,
            deliver,
            counters: Counters::default(),
        }
    }

    fn slot(idx: usize) -> usize {
        idx & (N - 1)
    }

    /// Write however much traffic the callback will accept, most-recent
    /// first in, oldest out.
    fn flush(&mut self) {
        self.counters.record_occupancy(self.write - self.read);
        while self.write > self.read {
            if !(self.deliver)(&self.ring[Self::slot(self.read)]) {
                break;
            }
            self.read += 1;
        }
    }
}

impl<const N: usize> Buffer for PollBuffer<N> {
    fn next_buffer(&mut self) -> Option<&mut Frame> {
        if !self.startup {
            self.flush();
        }
        if self.write - self.read >= N {
            self.counters.record_overrun();
            return None;
        }
        let idx = Self::slot(self.write);
        Some(&mut self.ring[idx])
    }

    fn send_buffer(&mut self) {
        debug_assert!(self.write >= self.read);
        debug_assert!(self.write < self.read + N);
        self.write += 1;

        let now = Instant::now();
        if let Some(last) = self.last_send {
            if now.duration_since(last) > STREAM_DEPTH {
                self.startup = true;
            }
        }
        self.last_send = Some(now);

        if self.startup {
            if self.write - self.read < N {
                return;
            }
            self.startup = false;
            for _ in 0..SILENCE_PREFIX {
                if !(self.deliver)(&Frame::default()) {
                    return;
                }
                self.counters.record_silence(1);
            }
        }
    }

    fn counters(&self) -> &Counters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting() -> (DeliverFn, Arc<Mutex<Vec<Frame>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let cb: DeliverFn = Arc::new(move |f: &Frame| {
            log2.lock().unwrap().push(*f);
            true
        });
        (cb, log)
    }

    #[test]
    fn injects_six_silence_frames_once_the_ring_fills_after_startup() {
        let (cb, log) = collecting();
        let mut buf = PollBuffer::<4>::new(cb);
        for _ in 0..4 {
            buf.next_buffer().unwrap();
            buf.send_buffer();
        }
        assert_eq!(buf.counters().silence_frames(), SILENCE_PREFIX);
        assert_eq!(log.lock().unwrap().len(), SILENCE_PREFIX);
    }

    #[test]
    fn overrun_when_ring_is_full_and_consumer_never_drains() {
        let cb: DeliverFn = Arc::new(|_: &Frame| false);
        let mut buf = PollBuffer::<4>::new(cb);
        for _ in 0..4 {
            assert!(buf.next_buffer().is_some());
            buf.send_buffer();
        }
        assert!(buf.next_buffer().is_none());
        assert_eq!(buf.counters().overruns(), 1);
    }
}

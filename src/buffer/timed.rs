//! Degenerate ring of one frame: immediate delivery unless the gap since
//! the previous `send_buffer` exceeds stream-depth, in which case a silence
//! prefix is flushed first.

use std::time::Instant;

use super::{Buffer, Counters, DeliverFn, STREAM_DEPTH};
use crate::device::Frame;

const SILENCE_PREFIX: usize = 6;

pub struct TimedBuffer {
    buffer: Frame,
    last_send: Option<Instant>,
    deliver: DeliverFn,
    counters: Counters,
}

impl TimedBuffer {
    pub fn new(deliver: DeliverFn) -> Self {
        TimedBuffer {
            buffer: Frame::default(),
            last_send: None,
            deliver,
            counters: Counters::default(),
        }
    }
}

impl Buffer for TimedBuffer {
    fn next_buffer(&mut self) -> Option<&mut Frame> {
        Some(&mut self.buffer)
    }

    fn send_buffer(&mut self) {
        let now = Instant::now();
        let gap = self.last_send.map(|last| now.duration_since(last) > STREAM_DEPTH).unwrap_or(false);
        self.last_send = Some(now);

        if gap {
            for _ in 0..SILENCE_PREFIX {
                if !(self.deliver)(&Frame::default()) {
                    break;
                }
                self.counters.record_silence(1);
            }
        }

        if !(self.deliver)(&self.buffer) {
            self.counters.record_failed_write();
        }
    }

    fn counters(&self) -> &Counters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread::sleep;

    #[test]
    fn sends_immediately_with_no_gap() {
        let mut buf = TimedBuffer::new(Arc::new(|_: &Frame| true));
        buf.next_buffer().unwrap();
        buf.send_buffer();
        assert_eq!(buf.counters().silence_frames(), 0);
        assert_eq!(buf.counters().failed_writes(), 0);
    }

    #[test]
    fn injects_silence_after_a_long_gap() {
        let mut buf = TimedBuffer::new(Arc::new(|_: &Frame| true));
        buf.next_buffer().unwrap();
        buf.send_buffer();
        sleep(STREAM_DEPTH + std::time::Duration::from_millis(10));
        buf.next_buffer().unwrap();
        buf.send_buffer();
        assert_eq!(buf.counters().silence_frames(), SILENCE_PREFIX);
    }
}

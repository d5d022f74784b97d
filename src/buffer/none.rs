//! Pass-through buffer: no queueing, `send_buffer` calls the delivery
//! callback synchronously.

use super::{Buffer, Counters, DeliverFn};
use crate::device::Frame;

pub struct NoneBuffer {
    scratch: Frame,
    deliver: DeliverFn,
    counters: Counters,
}

impl NoneBuffer {
    pub fn new(deliver: DeliverFn) -> Self {
        NoneBuffer {
            scratch: Frame::default(),
            deliver,
            counters: Counters::default(),
        }
    }
}

impl Buffer for NoneBuffer {
    fn next_buffer(&mut self) -> Option<&mut Frame> {
        Some(&mut self.scratch)
    }

    fn send_buffer(&mut self) {
        if !(self.deliver)(&self.scratch) {
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn forwards_every_frame_synchronously() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let mut buf = NoneBuffer::new(Arc::new(move |_: &Frame| {
            calls2.fetch_add(1, Ordering::Relaxed);
            true
        }));
        buf.next_buffer().unwrap();
        buf.send_buffer();
        buf.next_buffer().unwrap();
        buf.send_buffer();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(buf.counters().failed_writes(), 0);
    }

    #[test]
    fn counts_failed_writes() {
        let mut buf = NoneBuffer::new(Arc::new(|_: &Frame| false));
        buf.next_buffer().unwrap();
        buf.send_buffer();
        assert_eq!(buf.counters().failed_writes(), 1);
    }
}

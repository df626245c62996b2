//! Bounded SPSC queue between the engine's stdin pump thread and its hot
//! loop. The consumer side never blocks inside the loop; the backoff
//! receive is only used while waiting for the handshake.

use crossbeam::utils::Backoff;
use ringbuf::consumer::Consumer;
use ringbuf::producer::Producer;
use ringbuf::traits::Split;
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::thread;
use std::time::{Duration, Instant};

pub fn bounded<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
    let rb = HeapRb::<T>::new(capacity);
    let (prod, cons) = rb.split();
    (RingSender { prod }, RingReceiver { cons })
}

pub struct RingSender<T> {
    prod: HeapProd<T>,
}

impl<T> RingSender<T> {
    /// Non-blocking push; hands the value back when the queue is full.
    #[inline]
    pub fn try_send(&mut self, value: T) -> Result<(), T> {
        self.prod.try_push(value)
    }

    /// Push, yielding briefly while the queue is full. The command channel
    /// is lossless FIFO, so the pump never drops on backpressure.
    pub fn send(&mut self, mut value: T) {
        loop {
            match self.prod.try_push(value) {
                Ok(()) => return,
                Err(v) => {
                    value = v;
                    thread::sleep(Duration::from_micros(200));
                }
            }
        }
    }
}

pub struct RingReceiver<T> {
    cons: HeapCons<T>,
}

impl<T> RingReceiver<T> {
    #[inline]
    pub fn try_recv(&mut self) -> Option<T> {
        self.cons.try_pop()
    }

    /// Receive with a deadline, spinning down from busy-wait to sleeps.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<T> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            if let Some(v) = self.cons.try_pop() {
                return Some(v);
            }
            if start.elapsed() >= timeout {
                return None;
            }
            spins = spins.saturating_add(1);
            if spins < 64 {
                backoff.spin();
            } else if spins < 256 {
                backoff.snooze();
            } else {
                thread::sleep(Duration::from_micros(200));
            }
        }
    }
}

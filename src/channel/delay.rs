//! Decorator that forwards messages after a fixed delay.

use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::channel::Channel;

enum Deferred {
    Send {
        due: Instant,
        status: u8,
        data1: u8,
        data2: u8,
    },
    Release,
}

/// Wraps another channel and delivers each message `delay` milliseconds
/// later, preserving arrival order.
///
/// Delivery happens on a dedicated worker thread per decorator, so the
/// sending side never blocks. `release` discards pending messages, releases
/// the wrapped channel on the worker and joins it, leaving no lease behind.
pub struct DelayedChannel {
    tx: Option<Sender<Deferred>>,
    worker: Option<JoinHandle<()>>,
    delay: Duration,
}

impl DelayedChannel {
    pub fn new(inner: Box<dyn Channel>, delay_ms: u64) -> Self {
        let (tx, rx) = mpsc::channel();

        let worker = thread::spawn(move || {
            let mut inner = inner;
            let mut pending: VecDeque<(Instant, [u8; 3])> = VecDeque::new();

            'worker: loop {
                let timeout = match pending.front() {
                    Some((due, _)) => due.saturating_duration_since(Instant::now()),
                    None => Duration::from_secs(3600),
                };

                match rx.recv_timeout(timeout) {
                    Ok(Deferred::Send {
                        due,
                        status,
                        data1,
                        data2,
                    }) => pending.push_back((due, [status, data1, data2])),
                    // Pending messages are deliberately dropped: the element
                    // is disengaging.
                    Ok(Deferred::Release) => break 'worker,
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break 'worker,
                }

                let now = Instant::now();
                while let Some((due, _)) = pending.front() {
                    if *due > now {
                        break;
                    }
                    let (_, [status, data1, data2]) =
                        pending.pop_front().unwrap_or((now, [0, 0, 0]));
                    inner.send(status, data1, data2);
                }
            }

            inner.release();
        });

        Self {
            tx: Some(tx),
            worker: Some(worker),
            delay: Duration::from_millis(delay_ms),
        }
    }
}

impl Channel for DelayedChannel {
    fn send(&mut self, status: u8, data1: u8, data2: u8) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Deferred::Send {
                due: Instant::now() + self.delay,
                status,
                data1,
                data2,
            });
        }
    }

    fn release(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Deferred::Release);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for DelayedChannel {
    fn drop(&mut self) {
        self.release();
    }
}

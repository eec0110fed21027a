//! Bounded handoff queue between the decode loop and the output callback.
//!
//! Carries interleaved `f32` samples. The producer side blocks while the
//! queue is full, which is what makes the sink's `play` call a blocking
//! transfer: by the time it returns, the caller's chunk buffer is free for
//! reuse. The consumer side never blocks, so it is safe inside a real-time
//! audio callback. `close()` plus drain-waiting makes shutdown deterministic.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct SampleQueue {
    channels: usize,
    max_samples: usize,
    inner: Mutex<Inner>,
    cv: Condvar,
}

struct Inner {
    queue: VecDeque<f32>,
    closed: bool,
}

/// Queue capacity in samples for a `(rate, channels, seconds)` target, with a
/// safe fallback for non-finite or non-positive durations.
pub fn samples_for(rate_hz: u32, channels: usize, seconds: f32) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels).max(channels)
}

impl SampleQueue {
    pub fn new(channels: usize, max_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            max_samples: max_samples.max(channels),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Mark the queue finished and wake every waiter. Idempotent.
    ///
    /// Blocked pushes return early; pops keep serving buffered samples until
    /// the queue drains.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Push interleaved samples, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before everything fit; the
    /// remainder is dropped in that case.
    pub fn push_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();
            while g.queue.len() >= self.max_samples && !g.closed {
                g = self.cv.wait(g).unwrap();
            }
            if g.closed {
                return false;
            }
            while offset < samples.len() && g.queue.len() < self.max_samples {
                g.queue.push_back(samples[offset]);
                offset += 1;
            }
            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Pop up to `max_samples` into `out` without blocking, whole frames only.
    ///
    /// `out` is cleared first so the caller can reuse one allocation across
    /// calls. Returns the number of samples delivered (0 when nothing whole
    /// is buffered).
    pub fn pop_up_to(&self, max_samples: usize, out: &mut Vec<f32>) -> usize {
        out.clear();
        let mut g = self.inner.lock().unwrap();
        let whole = (g.queue.len() / self.channels) * self.channels;
        let take = whole.min((max_samples / self.channels) * self.channels);
        if take == 0 {
            return 0;
        }
        out.extend(g.queue.drain(..take));
        drop(g);
        self.cv.notify_all();
        take
    }

    /// Block until the queue is closed and fully drained, or `deadline`
    /// elapses. Returns `true` when drained.
    pub fn wait_drained(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        let mut g = self.inner.lock().unwrap();
        loop {
            if g.closed && g.queue.is_empty() {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return false;
            }
            let (ng, _) = self
                .cv
                .wait_timeout(g, (deadline - elapsed).min(Duration::from_millis(50)))
                .unwrap();
            g = ng;
        }
    }
}

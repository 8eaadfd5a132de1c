//! Rolling throughput counter
//!
//! Tracks completions over a sliding window of rotating buckets. Used for
//! the cluster-wide tasks-per-second figure that is exported as a gauge and
//! broadcast to providers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Sliding-window event counter.
#[derive(Debug)]
pub struct RateCounter {
    buckets: Vec<AtomicU64>,
    bucket_duration: Duration,
    current: AtomicUsize,
    last_rotation: Mutex<Instant>,
}

impl RateCounter {
    /// A counter covering `window`, divided into `num_buckets` slices.
    pub fn new(window: Duration, num_buckets: usize) -> Self {
        assert!(num_buckets > 0, "need at least one bucket");
        Self {
            buckets: (0..num_buckets).map(|_| AtomicU64::new(0)).collect(),
            bucket_duration: window / num_buckets as u32,
            current: AtomicUsize::new(0),
            last_rotation: Mutex::new(Instant::now()),
        }
    }

    /// Record `count` events.
    pub fn incr(&self, count: u64) {
        self.maybe_rotate();
        let idx = self.current.load(Ordering::Relaxed);
        self.buckets[idx].fetch_add(count, Ordering::Relaxed);
    }

    /// Total events inside the window.
    pub fn total(&self) -> u64 {
        self.maybe_rotate();
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    /// Events per second over the window.
    pub fn rate(&self) -> f64 {
        let window_secs = self.bucket_duration.as_secs_f64() * self.buckets.len() as f64;
        self.total() as f64 / window_secs
    }

    fn maybe_rotate(&self) {
        let now = Instant::now();
        let mut last = self.last_rotation.lock();
        let elapsed = now.duration_since(*last);
        if elapsed < self.bucket_duration {
            return;
        }

        let steps = (elapsed.as_secs_f64() / self.bucket_duration.as_secs_f64()) as usize;
        *last = now;
        for _ in 0..steps.min(self.buckets.len()) {
            let next = (self.current.load(Ordering::Relaxed) + 1) % self.buckets.len();
            self.buckets[next].store(0, Ordering::Relaxed);
            self.current.store(next, Ordering::Relaxed);
        }
    }
}

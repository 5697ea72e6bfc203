//! Time sources
//!
//! Two clocks drive the engine. A [`Clock`] is the monotonic wall clock the
//! transport computes tick deadlines against; [`AudioClock`] counts rendered
//! frames and is the timebase parameter ramps are scheduled on.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source, measured from an arbitrary fixed epoch
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Duration;
}

/// Real clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// The instant at which this clock reads `time`
    pub fn instant_at(&self, time: Duration) -> Instant {
        self.epoch + time
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Clock that only moves when told to
///
/// Clones share the same reading, so a test can keep one handle and give
/// another to the engine.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.nanos.store(to.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Atomic f64 for lock-free sharing between threads
///
/// Stored as the bit pattern in an `AtomicU64`.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Audio-context time: frames rendered so far at the current sample rate
#[derive(Debug)]
pub struct AudioClock {
    frames: AtomicU64,
    sample_rate: AtomicF64,
}

impl AudioClock {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            frames: AtomicU64::new(0),
            sample_rate: AtomicF64::new(sample_rate),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate.get()
    }

    /// Set by the backend once the device rate is known
    pub fn set_sample_rate(&self, sample_rate: f64) {
        self.sample_rate.set(sample_rate);
    }

    /// Seconds of audio rendered so far
    pub fn now(&self) -> f64 {
        self.frames_to_secs(self.frames())
    }

    pub fn frames_to_secs(&self, frames: u64) -> f64 {
        let sample_rate = self.sample_rate();
        if sample_rate <= 0.0 {
            return 0.0;
        }
        frames as f64 / sample_rate
    }

    pub(crate) fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }
}

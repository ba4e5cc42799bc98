//! Monotonic time sources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A nanosecond time source.
///
/// Implementations used by the autotuner must be safe to share between the
/// consumer thread, operator workers and the controller thread.
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds since an arbitrary fixed origin.
    fn now_ns(&self) -> u64;

    /// Current time in milliseconds since the same origin as [`Clock::now_ns`].
    fn now_ms(&self) -> u64 {
        self.now_ns() / 1_000_000
    }
}

/// Shared handle to a clock.
pub type ClockRef = Arc<dyn Clock>;

/// Process-local monotonic clock.
///
/// Readings are anchored at construction and never repeat: two calls
/// always return strictly increasing values, even when the underlying
/// `Instant` resolution is coarser than a nanosecond.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    /// A fresh clock behind an [`Arc`], ready to hand to a context.
    pub fn shared() -> ClockRef {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let raw = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = raw.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Clock driven by hand, for deterministic tests and simulations.
///
/// Unlike [`MonotonicClock`] it may be set backwards, which is how callers
/// exercise the regression clamping of the timing recorder.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn set_ns(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance_ns(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_strictly_increases() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now_ns();
        for _ in 0..10_000 {
            let now = clock.now_ns();
            assert!(now > prev, "{} should be > {}", now, prev);
            prev = now;
        }
    }

    #[test]
    fn test_monotonic_clock_across_threads() {
        let clock = Arc::new(MonotonicClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || {
                    let mut readings = Vec::with_capacity(1000);
                    for _ in 0..1000 {
                        readings.push(clock.now_ns());
                    }
                    readings
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let len = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), len, "readings must never repeat");
    }

    #[test]
    fn test_now_ms_matches_ns() {
        let clock = ManualClock::new(5_500_000);
        assert_eq!(clock.now_ms(), 5);
    }

    #[test]
    fn test_manual_clock_can_regress() {
        let clock = ManualClock::new(1_000);
        clock.advance_ns(500);
        assert_eq!(clock.now_ns(), 1_500);
        clock.set_ns(10);
        assert_eq!(clock.now_ns(), 10);
    }
}

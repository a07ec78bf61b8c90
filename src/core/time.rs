//! Timing utilities: per-phase CPU timers and the clock used for tile timeouts

use std::cell::Cell;
use std::time::{Duration, Instant};

/// Measures the CPU time of one per-frame phase
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    begin: Option<Instant>,
    elapsed: Duration,
}

impl PhaseTimer {
    /// Create a cleared timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the measured time to zero
    pub fn clear(&mut self) {
        self.begin = None;
        self.elapsed = Duration::ZERO;
    }

    /// Start measuring
    pub fn begin(&mut self) {
        self.begin = Some(Instant::now());
    }

    /// Stop measuring. Without a matching `begin` the previous value is kept.
    pub fn end(&mut self) {
        if let Some(begin) = self.begin.take() {
            self.elapsed = begin.elapsed();
        }
    }

    /// Last measured duration in seconds
    pub fn seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }

    /// Last measured duration
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Source of the timestamps stamped onto tiles.
///
/// Timestamps are seconds on an arbitrary but monotonic origin.
pub trait Clock {
    fn now_seconds(&self) -> f32;
}

/// Wall clock, seconds since the clock was created
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_seconds(&self) -> f32 {
        self.origin.elapsed().as_secs_f32()
    }
}

/// Clock advanced by hand, for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<f32>,
}

impl ManualClock {
    pub fn new(start_seconds: f32) -> Self {
        Self { now: Cell::new(start_seconds) }
    }

    /// Move the clock forward
    pub fn advance(&self, seconds: f32) {
        self.now.set(self.now.get() + seconds);
    }

    pub fn set(&self, seconds: f32) {
        self.now.set(seconds);
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> f32 {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer_end_without_begin() {
        let mut timer = PhaseTimer::new();
        timer.end();
        assert_eq!(timer.seconds(), 0.0);

        timer.begin();
        timer.end();
        assert!(timer.seconds() >= 0.0);

        timer.clear();
        assert_eq!(timer.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1.0);
        clock.advance(0.5);
        assert_eq!(clock.now_seconds(), 1.5);
        clock.set(10.0);
        assert_eq!(clock.now_seconds(), 10.0);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_seconds();
        let b = clock.now_seconds();
        assert!(b >= a);
    }
}

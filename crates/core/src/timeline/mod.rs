use std::{
    thread,
    time::{Duration, Instant},
};

/// Monotonic show time shared by every loop so that timestamps produced on
/// different threads are comparable.
#[derive(Debug, Clone, Copy)]
pub struct ShowClock {
    origin: Instant,
}

impl ShowClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Seconds since the clock was started.
    pub fn now_seconds(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for ShowClock {
    fn default() -> Self {
        Self::start()
    }
}

/// Fixed-rate pacing for a loop: each cycle sleeps for whatever is left of
/// the period after the work is done, or not at all when it overran.
#[derive(Debug, Clone)]
pub struct FrameClock {
    period: Duration,
    cycle_start: Instant,
    overruns: u64,
}

impl FrameClock {
    pub fn from_rate(rate_hz: f64) -> Self {
        let period = if rate_hz > 0.0 {
            Duration::from_secs_f64(1.0 / rate_hz)
        } else {
            Duration::ZERO
        };
        Self {
            period,
            cycle_start: Instant::now(),
            overruns: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Marks the start of a cycle.
    pub fn begin(&mut self) {
        self.cycle_start = Instant::now();
    }

    /// Time left in the current cycle, zero when overrun.
    pub fn remaining(&self) -> Duration {
        self.period.saturating_sub(self.cycle_start.elapsed())
    }

    /// Sleeps out the remainder of the cycle and returns how long it slept.
    pub fn finish(&mut self) -> Duration {
        let remaining = self.remaining();
        if remaining.is_zero() {
            self.overruns += 1;
        } else {
            thread::sleep(remaining);
        }
        remaining
    }

    /// Cycles whose work took longer than the period.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_clock_advances() {
        let clock = ShowClock::start();
        thread::sleep(Duration::from_millis(2));
        assert!(clock.now_seconds() >= 0.002);
    }

    #[test]
    fn frame_clock_holds_the_period() {
        let mut clock = FrameClock::from_rate(200.0);
        let start = Instant::now();
        for _ in 0..10 {
            clock.begin();
            clock.finish();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
    }

    #[test]
    fn overrun_skips_sleep() {
        let mut clock = FrameClock::from_rate(1_000.0);
        clock.begin();
        thread::sleep(Duration::from_millis(3));
        assert_eq!(clock.finish(), Duration::ZERO);
        assert_eq!(clock.overruns(), 1);
    }
}

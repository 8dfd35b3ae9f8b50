//! Pipeline clock and synthetic frame timing

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::{ClockTime, FrameTiming};

/// Monotonic pipeline clock
///
/// All times are measured from a base `Instant` taken when the clock is
/// created. Clones share the same base.
#[derive(Clone)]
pub struct SystemClock {
    base: Arc<Instant>,
}

impl SystemClock {
    /// Create a new clock starting now
    pub fn new() -> Self {
        Self {
            base: Arc::new(Instant::now()),
        }
    }

    /// Current time on this clock
    pub fn now(&self) -> ClockTime {
        ClockTime::from_duration(self.base.elapsed())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemClock")
            .field("elapsed", &self.base.elapsed())
            .finish()
    }
}

/// Synthetic timing stamped on submitted frames
///
/// Keeps presentation timestamps advancing by at least one nominal frame
/// period between consecutive accepted frames, so the pipeline never sees
/// frames bunched closer than its nominal rate:
/// - if the previous accepted frame is less than one period old, the new
///   frame is stamped one period after it
/// - otherwise it is stamped with the current clock time
#[derive(Debug, Clone)]
pub struct FrameClock {
    frame_period: Duration,
    previous: Option<ClockTime>,
}

impl FrameClock {
    pub fn new(frame_period: Duration) -> Self {
        Self {
            frame_period,
            previous: None,
        }
    }

    pub fn frame_period(&self) -> Duration {
        self.frame_period
    }

    /// Timing for a frame submitted at `now`; the offset is filled in later
    pub fn timing_at(&self, now: ClockTime) -> FrameTiming {
        let pts = match self.previous {
            Some(previous) if now.saturating_since(previous) <= self.frame_period => {
                previous.add(self.frame_period)
            }
            _ => now,
        };

        FrameTiming {
            pts: Some(pts),
            dts: None,
            duration: Some(self.frame_period),
            offset: 0,
            offset_end: None,
        }
    }

    /// Record that the frame submitted at `now` was accepted
    pub fn commit(&mut self, now: ClockTime) {
        self.previous = Some(now);
    }

    /// Forget timing continuity, e.g. after a pipeline restart
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock::new();
        let t0 = clock.now();
        thread::sleep(Duration::from_millis(10));
        let t1 = clock.now();
        assert!(t1.saturating_since(t0) >= Duration::from_millis(10));
    }

    #[test]
    fn test_first_frame_uses_clock_time() {
        let clock = FrameClock::new(Duration::from_millis(100));
        let now = ClockTime::from_duration(Duration::from_secs(5));
        let timing = clock.timing_at(now);

        assert_eq!(timing.pts, Some(now));
        assert_eq!(timing.dts, None);
        assert_eq!(timing.duration, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_close_frames_are_spaced_by_period() {
        let period = Duration::from_millis(100);
        let mut clock = FrameClock::new(period);
        let t0 = ClockTime::from_duration(Duration::from_secs(1));
        clock.commit(t0);

        let t1 = t0.add(Duration::from_millis(30));
        assert_eq!(clock.timing_at(t1).pts, Some(t0.add(period)));

        // Far enough apart: the clock time wins
        let t2 = t0.add(Duration::from_millis(250));
        assert_eq!(clock.timing_at(t2).pts, Some(t2));
    }

    #[test]
    fn test_reset_forgets_previous() {
        let mut clock = FrameClock::new(Duration::from_millis(100));
        clock.commit(ClockTime::from_nanos(1_000));
        clock.reset();

        let now = ClockTime::from_nanos(2_000);
        assert_eq!(clock.timing_at(now).pts, Some(now));
    }
}

//! Timing and side-channel metadata carried by native buffers

use std::time::Duration;

/// Nanosecond clock time on the pipeline clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime(u64);

impl ClockTime {
    /// Zero time
    pub const ZERO: ClockTime = ClockTime(0);

    /// Create a clock time from nanoseconds
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create a clock time from a duration
    pub fn from_duration(duration: Duration) -> Self {
        Self(duration.as_nanos() as u64)
    }

    /// Nanoseconds since the clock origin
    pub const fn nanos(&self) -> u64 {
        self.0
    }

    /// Convert to duration
    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.0)
    }

    /// Add a duration to this time
    pub fn add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as u64))
    }

    /// Elapsed time between `earlier` and this time, zero if `earlier` is later
    pub fn saturating_since(&self, earlier: ClockTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{}.{:09}s", secs, nanos)
    }
}

/// Timing fields stamped on a buffer
///
/// `offset` doubles as the correspondence key: the bridge writes the
/// correspondence id here at submission and restores it on the matched
/// output buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTiming {
    /// Presentation timestamp
    pub pts: Option<ClockTime>,
    /// Decode timestamp
    pub dts: Option<ClockTime>,
    /// Frame duration
    pub duration: Option<Duration>,
    /// Sequence offset of this frame
    pub offset: u64,
    /// End offset, unused by the bridge but carried through
    pub offset_end: Option<u64>,
}

/// Everything attached to a native buffer besides its bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferMeta {
    /// Timing fields
    pub timing: FrameTiming,
    /// Correspondence id attached through the pipeline's metadata side-channel
    pub correspondence_id: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_time_arithmetic() {
        let t = ClockTime::from_duration(Duration::from_millis(100));
        assert_eq!(t.nanos(), 100_000_000);

        let later = t.add(Duration::from_millis(50));
        assert_eq!(later.saturating_since(t), Duration::from_millis(50));
        assert_eq!(t.saturating_since(later), Duration::ZERO);
    }

    #[test]
    fn test_clock_time_display() {
        let t = ClockTime::from_nanos(1_500_000_000);
        assert_eq!(t.to_string(), "1.500000000s");
    }
}

//! Throughput windows and throttled reporting
//!
//! Diagnostics only: nothing here feeds back into control flow.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Rolling frame count and byte total over a reporting interval
#[derive(Debug)]
pub struct RateWindow {
    interval: Duration,
    started: Instant,
    frames: u64,
    bytes: u64,
}

/// One closed reporting interval
#[derive(Debug, Clone, Copy)]
pub struct RateReport {
    pub frames: u64,
    pub rate_hz: f64,
    pub kib_per_sec: f64,
}

impl std::fmt::Display for RateReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1} Hz, bandwidth {:.1} KiB/s",
            self.rate_hz, self.kib_per_sec
        )
    }
}

impl RateWindow {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
            frames: 0,
            bytes: 0,
        }
    }

    /// Count one frame of `bytes` bytes
    ///
    /// Returns a report and starts a new window once the interval elapsed.
    pub fn record(&mut self, bytes: usize) -> Option<RateReport> {
        self.frames += 1;
        self.bytes += bytes as u64;

        let elapsed = self.started.elapsed();
        if elapsed < self.interval {
            return None;
        }

        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let report = RateReport {
            frames: self.frames,
            rate_hz: self.frames as f64 / secs,
            kib_per_sec: self.bytes as f64 / secs / 1024.0,
        };

        self.started = Instant::now();
        self.frames = 0;
        self.bytes = 0;
        Some(report)
    }
}

/// Lets one in every `every` occurrences through
///
/// Used to keep hot-path warnings from flooding the log.
#[derive(Debug)]
pub struct ReportThrottle {
    every: u32,
    count: AtomicU32,
}

impl ReportThrottle {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            count: AtomicU32::new(0),
        }
    }

    /// Record an occurrence, `true` on every `every`-th one
    pub fn hit(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.every {
            self.count.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn every(&self) -> u32 {
        self.every
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_window_reports_after_interval() {
        let mut window = RateWindow::new(Duration::from_millis(50));
        assert!(window.record(1024).is_none());

        std::thread::sleep(Duration::from_millis(60));
        let report = window.record(1024).unwrap();
        assert_eq!(report.frames, 2);
        assert!(report.rate_hz > 0.0);
        assert!(report.kib_per_sec > 0.0);

        // Window restarted
        assert!(window.record(1).is_none());
    }

    #[test]
    fn test_throttle_every_kth() {
        let throttle = ReportThrottle::new(3);
        let hits: Vec<bool> = (0..7).map(|_| throttle.hit()).collect();
        assert_eq!(hits, vec![false, false, true, false, false, true, false]);
    }
}

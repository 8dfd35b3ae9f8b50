//! Health counters for the bridge and its supervisor

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Health metrics for a supervised pipeline
///
/// Tracks counters and the time of the last egress delivery.
/// All fields use atomic operations for thread-safe access from the
/// submitting thread, the egress thread and the status thread.
pub struct BridgeHealth {
    /// Frames accepted by the ingest port
    pub frames_submitted: AtomicU64,

    /// Submissions rejected (input bound reached or ingest refused)
    pub input_rejections: AtomicU64,

    /// Pending entries evicted because the side-queue hit its safety bound
    pub pending_evictions: AtomicU64,

    /// Matched frames published to the output queue
    pub frames_delivered: AtomicU64,

    /// Matched frames dropped because the output queue was full or draining
    pub output_drops: AtomicU64,

    /// Egress results without a correspondence id
    pub uncorrelated: AtomicU64,

    /// Egress results that found no pending entry
    pub unmatched: AtomicU64,

    /// Pending entries discarded as stale while matching or on restart
    pub stale_skipped: AtomicU64,

    /// Egress results dropped because their buffer could not be mapped
    pub map_failures: AtomicU64,

    /// Stop/start cycles forced by the watchdog
    pub watchdog_restarts: AtomicU64,

    /// Payload bytes pushed into the pipeline
    pub bytes_in: AtomicU64,

    /// Payload bytes received from the pipeline
    pub bytes_out: AtomicU64,

    /// Microseconds since `epoch` of the last egress delivery
    last_delivery: AtomicU64,

    epoch: Instant,
}

impl BridgeHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            frames_submitted: AtomicU64::new(0),
            input_rejections: AtomicU64::new(0),
            pending_evictions: AtomicU64::new(0),
            frames_delivered: AtomicU64::new(0),
            output_drops: AtomicU64::new(0),
            uncorrelated: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            stale_skipped: AtomicU64::new(0),
            map_failures: AtomicU64::new(0),
            watchdog_restarts: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_delivery: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Record a frame accepted by ingest
    pub fn record_submit(&self, size: usize) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a rejected submission
    pub fn record_rejection(&self) {
        self.input_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an evicted pending entry
    pub fn record_eviction(&self) {
        self.pending_evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame received from egress
    pub fn record_egress_bytes(&self, size: usize) {
        self.bytes_out.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a frame published to the output queue
    pub fn record_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame dropped at publication
    pub fn record_output_drop(&self) {
        self.output_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an egress result without correspondence id
    pub fn record_uncorrelated(&self) {
        self.uncorrelated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an egress result without pending entry
    pub fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` stale pending entries
    pub fn record_stale(&self, count: u64) {
        self.stale_skipped.fetch_add(count, Ordering::Relaxed);
    }

    /// Record an egress result dropped as unreadable
    pub fn record_map_failure(&self) {
        self.map_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a watchdog restart
    pub fn record_watchdog_restart(&self) {
        self.watchdog_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark that the egress side just delivered something
    pub fn mark_delivery(&self) {
        let micros = self.epoch.elapsed().as_micros() as u64;
        self.last_delivery.store(micros, Ordering::Relaxed);
    }

    /// Time since the last delivery (or since creation if none yet)
    pub fn since_last_delivery(&self) -> Duration {
        let last = Duration::from_micros(self.last_delivery.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Check if no delivery happened within `threshold`
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.since_last_delivery() >= threshold
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted.load(Ordering::Relaxed)
    }

    pub fn input_rejections(&self) -> u64 {
        self.input_rejections.load(Ordering::Relaxed)
    }

    pub fn pending_evictions(&self) -> u64 {
        self.pending_evictions.load(Ordering::Relaxed)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }

    pub fn output_drops(&self) -> u64 {
        self.output_drops.load(Ordering::Relaxed)
    }

    pub fn uncorrelated(&self) -> u64 {
        self.uncorrelated.load(Ordering::Relaxed)
    }

    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    pub fn stale_skipped(&self) -> u64 {
        self.stale_skipped.load(Ordering::Relaxed)
    }

    pub fn map_failures(&self) -> u64 {
        self.map_failures.load(Ordering::Relaxed)
    }

    pub fn watchdog_restarts(&self) -> u64 {
        self.watchdog_restarts.load(Ordering::Relaxed)
    }

    /// Percentage of submitted frames that never reached the output queue
    pub fn loss_rate(&self) -> f64 {
        let submitted = self.frames_submitted();
        if submitted == 0 {
            return 0.0;
        }
        let delivered = self.frames_delivered().min(submitted);
        ((submitted - delivered) as f64 / submitted as f64) * 100.0
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_submitted: self.frames_submitted(),
            frames_delivered: self.frames_delivered(),
            input_rejections: self.input_rejections(),
            pending_evictions: self.pending_evictions(),
            output_drops: self.output_drops(),
            uncorrelated: self.uncorrelated(),
            unmatched: self.unmatched(),
            stale_skipped: self.stale_skipped(),
            map_failures: self.map_failures(),
            watchdog_restarts: self.watchdog_restarts(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            loss_rate: self.loss_rate(),
        }
    }
}

impl Default for BridgeHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub frames_submitted: u64,
    pub frames_delivered: u64,
    pub input_rejections: u64,
    pub pending_evictions: u64,
    pub output_drops: u64,
    pub uncorrelated: u64,
    pub unmatched: u64,
    pub stale_skipped: u64,
    pub map_failures: u64,
    pub watchdog_restarts: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub loss_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} submitted, {} delivered ({:.2}% lost), {} rejected, {} evicted, {} output drops, {} uncorrelated, {} unmatched, {} stale, {} unreadable, {} watchdog restarts, {} bytes in, {} bytes out",
            self.frames_submitted,
            self.frames_delivered,
            self.loss_rate,
            self.input_rejections,
            self.pending_evictions,
            self.output_drops,
            self.uncorrelated,
            self.unmatched,
            self.stale_skipped,
            self.map_failures,
            self.watchdog_restarts,
            self.bytes_in,
            self.bytes_out
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = BridgeHealth::new();

        health.record_submit(1000);
        health.record_submit(2000);
        health.record_submit(1500);
        health.record_delivered();
        health.record_delivered();

        assert_eq!(health.frames_submitted(), 3);
        assert_eq!(health.frames_delivered(), 2);
        assert_eq!(health.summary().bytes_in, 4500);
        assert!(health.loss_rate() > 33.0 && health.loss_rate() < 34.0);

        health.record_stale(2);
        health.record_output_drop();
        assert_eq!(health.stale_skipped(), 2);
        assert_eq!(health.output_drops(), 1);

        health.record_map_failure();
        assert_eq!(health.summary().map_failures, 1);
    }

    #[test]
    fn test_stall_detection() {
        let health = BridgeHealth::new();
        health.mark_delivery();

        // Should not be stalled immediately
        assert!(!health.is_stalled(Duration::from_secs(1)));

        // Simulate stall by not recording deliveries
        std::thread::sleep(Duration::from_millis(150));
        assert!(health.is_stalled(Duration::from_millis(100)));

        health.mark_delivery();
        assert!(!health.is_stalled(Duration::from_millis(100)));
    }
}

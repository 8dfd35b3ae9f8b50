use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::bridge::DiscardPolicy;
use crate::error::{Error, Result};

/// Stall detection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Time without egress delivery after which a submit counts as stalled
    pub timeout_ms: u64,
    /// Consecutive stalled submits that trigger a restart
    pub reset_count: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            reset_count: 10,
        }
    }
}

impl WatchdogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Bridge and supervisor settings
///
/// Every field is optional in the JSON form and falls back to its default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub discard_policy: DiscardPolicy,
    /// Capacity of the output queue
    pub max_output_queue: usize,
    /// Frames in flight before submissions are rejected (discard_input only)
    pub max_input_queue: usize,
    /// Safety bound on pending entries, whatever the policy
    pub max_pending: usize,
    pub frame_drop_report_rate: u32,
    pub correspondence_fail_report_rate: u32,
    pub push_poll_interval_ms: u64,
    pub status_poll_interval_ms: u64,
    /// Nominal frame period used for synthetic timestamps
    pub frame_period_ms: u64,
    pub rate_report_interval_ms: u64,
    /// Bytes queued on the ingest port before pushes block
    pub ingest_max_bytes: usize,
    pub watchdog: WatchdogConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            discard_policy: DiscardPolicy::DiscardInput,
            max_output_queue: 5,
            max_input_queue: 3,
            max_pending: 100,
            frame_drop_report_rate: 10,
            correspondence_fail_report_rate: 5,
            push_poll_interval_ms: 100,
            status_poll_interval_ms: 100,
            frame_period_ms: 100,
            rate_report_interval_ms: 1000,
            ingest_max_bytes: 5_000_000,
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load from a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the bridge cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_output_queue == 0 {
            return Err(Error::Config("max_output_queue must be at least 1".into()));
        }
        if self.max_input_queue == 0 {
            return Err(Error::Config("max_input_queue must be at least 1".into()));
        }
        if self.max_pending < self.max_input_queue {
            return Err(Error::Config(format!(
                "max_pending ({}) must not be smaller than max_input_queue ({})",
                self.max_pending, self.max_input_queue
            )));
        }
        if self.frame_period_ms == 0 {
            return Err(Error::Config("frame_period_ms must be positive".into()));
        }
        if self.push_poll_interval_ms == 0 || self.status_poll_interval_ms == 0 {
            return Err(Error::Config("poll intervals must be positive".into()));
        }
        Ok(())
    }

    pub fn push_poll_interval(&self) -> Duration {
        Duration::from_millis(self.push_poll_interval_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_millis(self.frame_period_ms)
    }

    pub fn rate_report_interval(&self) -> Duration {
        Duration::from_millis(self.rate_report_interval_ms)
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{ "discard_policy": "discard_output", "watchdog": { "reset_count": 3 } }"#,
        )
        .unwrap();

        assert_eq!(config.discard_policy, DiscardPolicy::DiscardOutput);
        assert_eq!(config.max_output_queue, 5);
        assert_eq!(config.watchdog.reset_count, 3);
        assert_eq!(config.watchdog.timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = BridgeConfig {
            max_output_queue: 0,
            ..BridgeConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_path() {
        let path = std::env::temp_dir().join(format!("framebridge-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "frame_period_ms": 40 }"#).unwrap();

        let config = BridgeConfig::from_path(&path).unwrap();
        assert_eq!(config.frame_period(), Duration::from_millis(40));

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(BridgeConfig::from_path(&path), Err(Error::Io(_))));
    }
}

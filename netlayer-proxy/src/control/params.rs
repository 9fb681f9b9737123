//! Enforcement thresholds for controlled connections

use crate::error::{LayerError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits applied to every connection a control layer wraps.
///
/// All values are milliseconds or bytes; zero disables the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlParameters {
    /// Cap on establishing the lower connection
    pub connect_timeout_ms: u64,
    /// Cap on the total lifetime of a connection
    pub overall_timeout_ms: u64,
    /// Length of each throughput measurement window
    pub throughput_window_ms: u64,
    /// Bytes (read plus written) required within each window
    pub throughput_min_bytes_per_window: u64,
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ControlParameters {
    /// No limits at all
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero(self.connect_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Option<Duration> {
        non_zero(self.overall_timeout_ms)
    }

    pub fn throughput_window(&self) -> Option<Duration> {
        non_zero(self.throughput_window_ms)
    }

    /// Whether the watchdog has anything to enforce after connect
    pub fn is_monitored(&self) -> bool {
        self.overall_timeout().is_some() || self.throughput_window().is_some()
    }

    /// Check the parameters against the watchdog that will enforce them
    pub fn validate(&self, tick: Duration) -> Result<()> {
        if self.throughput_min_bytes_per_window > 0 && self.throughput_window_ms == 0 {
            return Err(LayerError::InvalidParameters(format!(
                "throughput_min_bytes_per_window is {} but throughput_window_ms is 0",
                self.throughput_min_bytes_per_window
            )));
        }

        if let Some(window) = self.throughput_window() {
            if window < tick {
                return Err(LayerError::InvalidParameters(format!(
                    "throughput window {:?} is shorter than the watchdog tick {:?}",
                    window, tick
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_has_no_limits() {
        let params = ControlParameters::unlimited();
        assert_eq!(params, ControlParameters::default());
        assert!(params.connect_timeout().is_none());
        assert!(params.overall_timeout().is_none());
        assert!(params.throughput_window().is_none());
        assert!(!params.is_monitored());
        assert!(params.validate(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let params: ControlParameters = toml::from_str(
            r#"
            overall_timeout_ms = 600000
            throughput_window_ms = 30000
            throughput_min_bytes_per_window = 1024
            "#,
        )
        .unwrap();

        assert_eq!(params.connect_timeout_ms, 0);
        assert_eq!(params.overall_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(params.throughput_window(), Some(Duration::from_secs(30)));
        assert!(params.is_monitored());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: std::result::Result<ControlParameters, _> =
            toml::from_str("overall_timeout = 5");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_minimum_without_window() {
        let params = ControlParameters {
            throughput_min_bytes_per_window: 10,
            ..Default::default()
        };
        let err = params.validate(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, LayerError::InvalidParameters(_)));
    }

    #[test]
    fn test_validate_window_shorter_than_tick() {
        let params = ControlParameters {
            throughput_window_ms: 50,
            throughput_min_bytes_per_window: 10,
            ..Default::default()
        };
        assert!(params.validate(Duration::from_millis(100)).is_err());
        assert!(params.validate(Duration::from_millis(20)).is_ok());
    }
}

//! Canary deployment configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScenegateError};

/// Configuration for a canary rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Whether the canary cohort receives any traffic
    #[serde(default)]
    pub enabled: bool,

    /// Share of identities routed to the canary, in percent (0-100)
    #[serde(default = "default_traffic_percent")]
    pub traffic_percent: f64,

    /// Canary error rate, in percent, above which the canary is rolled back
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,

    /// Canary average latency, in seconds, above which the canary is rolled back
    #[serde(default = "default_latency_threshold")]
    pub latency_threshold: f64,

    /// Whether health breaches roll the canary back automatically
    #[serde(default = "default_auto_rollback")]
    pub auto_rollback: bool,

    /// Version label reported for canary responses
    #[serde(default = "default_version")]
    pub version: String,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            traffic_percent: default_traffic_percent(),
            error_threshold: default_error_threshold(),
            latency_threshold: default_latency_threshold(),
            auto_rollback: default_auto_rollback(),
            version: default_version(),
        }
    }
}

fn default_traffic_percent() -> f64 {
    5.0
}

fn default_error_threshold() -> f64 {
    5.0
}

fn default_latency_threshold() -> f64 {
    2.0
}

fn default_auto_rollback() -> bool {
    true
}

fn default_version() -> String {
    "canary".to_string()
}

impl CanaryConfig {
    /// Check that every threshold is in range.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.traffic_percent) {
            return Err(ScenegateError::Config(format!(
                "canary traffic_percent must be within 0-100, got {}",
                self.traffic_percent
            )));
        }
        if !(0.0..=100.0).contains(&self.error_threshold) {
            return Err(ScenegateError::Config(format!(
                "canary error_threshold must be within 0-100, got {}",
                self.error_threshold
            )));
        }
        if !self.latency_threshold.is_finite() || self.latency_threshold <= 0.0 {
            return Err(ScenegateError::Config(format!(
                "canary latency_threshold must be positive, got {}",
                self.latency_threshold
            )));
        }
        if self.version.trim().is_empty() {
            return Err(ScenegateError::Config(
                "canary version must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CanaryConfig::default();
        assert!(!config.enabled);
        assert!(config.auto_rollback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let config: CanaryConfig =
            serde_yaml::from_str("enabled: true\ntraffic_percent: 25\nversion: v2.3.0\n").unwrap();

        assert!(config.enabled);
        assert_eq!(config.traffic_percent, 25.0);
        assert_eq!(config.version, "v2.3.0");
        assert_eq!(config.error_threshold, 5.0);
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let config = CanaryConfig {
            traffic_percent: 120.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ScenegateError::Config(_))));

        let config = CanaryConfig {
            traffic_percent: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CanaryConfig {
            latency_threshold: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CanaryConfig {
            version: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

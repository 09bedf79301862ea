//! Automatic rollback policy.

use std::fmt;

use super::cohort::Cohort;
use super::config::CanaryConfig;
use super::metrics::CanaryMetrics;

/// Canary requests required before the policy reacts.
pub const MIN_CANARY_REQUESTS: u64 = 100;

/// The health breach that caused a rollback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RollbackTrigger {
    /// Canary error rate above the absolute threshold
    ErrorRate { canary: f64, threshold: f64 },
    /// Canary mean latency above the threshold
    Latency { canary: f64, threshold: f64 },
    /// Canary error rate more than twice the stable error rate
    RelativeErrorRate { canary: f64, stable: f64 },
}

impl fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackTrigger::ErrorRate { canary, threshold } => write!(
                f,
                "canary error rate {:.2}% exceeds threshold {:.2}%",
                canary, threshold
            ),
            RollbackTrigger::Latency { canary, threshold } => write!(
                f,
                "canary average latency {:.3}s exceeds threshold {:.3}s",
                canary, threshold
            ),
            RollbackTrigger::RelativeErrorRate { canary, stable } => write!(
                f,
                "canary error rate {:.2}% is more than twice stable error rate {:.2}%",
                canary, stable
            ),
        }
    }
}

/// Decide whether the canary should be rolled back.
///
/// Conditions are checked in priority order and only the first match is
/// reported. Nothing fires before [`MIN_CANARY_REQUESTS`] canary requests.
pub fn evaluate(metrics: &CanaryMetrics, config: &CanaryConfig) -> Option<RollbackTrigger> {
    let canary = metrics.cohort(Cohort::Canary);
    if canary.requests() < MIN_CANARY_REQUESTS {
        return None;
    }
    let stable = metrics.cohort(Cohort::Stable);

    let canary_error_rate = canary.error_rate();
    let stable_error_rate = stable.error_rate();
    let canary_latency = canary.avg_latency();

    if canary_error_rate > config.error_threshold {
        return Some(RollbackTrigger::ErrorRate {
            canary: canary_error_rate,
            threshold: config.error_threshold,
        });
    }

    if canary_latency > config.latency_threshold {
        return Some(RollbackTrigger::Latency {
            canary: canary_latency,
            threshold: config.latency_threshold,
        });
    }

    // Fires on any positive stable rate, however small both rates are.
    if stable_error_rate > 0.0 && canary_error_rate > 2.0 * stable_error_rate {
        return Some(RollbackTrigger::RelativeErrorRate {
            canary: canary_error_rate,
            stable: stable_error_rate,
        });
    }

    None
}

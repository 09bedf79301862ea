//! Canary traffic router with automatic rollback.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::cohort::{assign_cohort, Cohort};
use super::config::CanaryConfig;
use super::metrics::{CanaryMetrics, MetricsSnapshot};
use super::policy;
use crate::error::Result;

/// Version label reported for stable responses.
pub const STABLE_VERSION: &str = "stable";

/// Activation state of the rollout.
#[derive(Debug, Clone, Default)]
struct RolloutState {
    active: bool,
    rollback_reason: Option<String>,
    rolled_back_at: Option<DateTime<Utc>>,
}

/// Splits traffic between the stable and canary versions.
///
/// The activation flag and the metrics sit behind separate locks, so
/// steady-state traffic only contends on the metrics lock when recording an
/// outcome. Neither lock is held while a request is being served.
#[derive(Debug)]
pub struct CanaryRouter {
    config: CanaryConfig,
    state: RwLock<RolloutState>,
    metrics: RwLock<CanaryMetrics>,
}

impl CanaryRouter {
    /// Create a router. The canary starts active when the config enables it.
    pub fn new(config: CanaryConfig) -> Result<Self> {
        config.validate()?;

        info!(
            enabled = config.enabled,
            traffic_percent = config.traffic_percent,
            version = %config.version,
            auto_rollback = config.auto_rollback,
            "Canary router initialized"
        );

        Ok(Self {
            state: RwLock::new(RolloutState {
                active: config.enabled,
                ..Default::default()
            }),
            metrics: RwLock::new(CanaryMetrics::new()),
            config,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &CanaryConfig {
        &self.config
    }

    /// Whether the canary cohort currently receives traffic.
    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    /// Why the canary was rolled back, if it was.
    pub fn rollback_reason(&self) -> Option<String> {
        self.state.read().rollback_reason.clone()
    }

    /// Assign a request identity to a cohort.
    pub fn assign(&self, identity: &str) -> Cohort {
        if !self.is_active() {
            return Cohort::Stable;
        }
        assign_cohort(identity, self.config.traffic_percent)
    }

    /// Version label for responses served by `cohort`.
    pub fn version_for(&self, cohort: Cohort) -> &str {
        match cohort {
            Cohort::Canary => &self.config.version,
            Cohort::Stable => STABLE_VERSION,
        }
    }

    /// Record a completed request and apply the rollback policy.
    ///
    /// Returns `true` if this outcome caused a rollback.
    pub fn record(&self, cohort: Cohort, elapsed: Duration, is_error: bool) -> bool {
        let evaluate = cohort == Cohort::Canary && self.config.auto_rollback && self.is_active();

        let trigger = {
            let mut metrics = self.metrics.write();
            metrics.record(cohort, elapsed.as_secs_f64(), is_error);
            if evaluate {
                policy::evaluate(&metrics, &self.config)
            } else {
                None
            }
        };

        match trigger {
            Some(trigger) => self.rollback(&trigger.to_string()),
            None => false,
        }
    }

    /// Stop routing traffic to the canary.
    ///
    /// Only the first call has an effect; it returns `true`. Requests already
    /// in flight finish on the cohort they were assigned.
    pub fn rollback(&self, reason: &str) -> bool {
        let mut state = self.state.write();
        if !state.active {
            debug!(reason = %reason, "Canary already inactive, ignoring rollback");
            return false;
        }

        state.active = false;
        state.rollback_reason = Some(reason.to_string());
        state.rolled_back_at = Some(Utc::now());

        warn!(
            version = %self.config.version,
            reason = %reason,
            "Canary rolled back"
        );
        true
    }

    /// When the rollback happened, if it did.
    pub fn rolled_back_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().rolled_back_at
    }

    /// Clear both cohorts and restart the observation window.
    pub fn reset_metrics(&self) {
        *self.metrics.write() = CanaryMetrics::new();
        info!(version = %self.config.version, "Canary metrics reset");
    }

    /// Point-in-time view of the rollout.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (active, rollback_reason) = {
            let state = self.state.read();
            (state.active, state.rollback_reason.clone())
        };

        let metrics = self.metrics.read();
        let window_start = metrics.window_start();
        let window_duration_secs = (Utc::now() - window_start)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();

        MetricsSnapshot {
            canary: metrics.cohort(Cohort::Canary).snapshot(),
            stable: metrics.cohort(Cohort::Stable).snapshot(),
            window_start,
            window_duration_secs,
            active,
            version: self.config.version.clone(),
            rollback_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(traffic_percent: f64) -> CanaryConfig {
        CanaryConfig {
            enabled: true,
            traffic_percent,
            error_threshold: 5.0,
            latency_threshold: 2.0,
            auto_rollback: true,
            version: "v2.0.0".to_string(),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(CanaryRouter::new(config(150.0)).is_err());
    }

    #[test]
    fn test_disabled_router_routes_stable() {
        let router = CanaryRouter::new(CanaryConfig {
            enabled: false,
            ..config(100.0)
        })
        .unwrap();

        assert!(!router.is_active());
        assert_eq!(router.assign("user:1"), Cohort::Stable);
    }

    #[test]
    fn test_full_rollout_routes_canary() {
        let router = CanaryRouter::new(config(100.0)).unwrap();
        assert_eq!(router.assign("user:1"), Cohort::Canary);
        assert_eq!(router.version_for(Cohort::Canary), "v2.0.0");
        assert_eq!(router.version_for(Cohort::Stable), STABLE_VERSION);
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let router = CanaryRouter::new(config(100.0)).unwrap();

        assert!(router.rollback("x"));
        assert!(!router.is_active());
        let first_at = router.rolled_back_at();

        assert!(!router.rollback("y"));
        assert!(!router.is_active());
        assert_eq!(router.rollback_reason().as_deref(), Some("x"));
        assert_eq!(router.rolled_back_at(), first_at);
    }

    #[test]
    fn test_erroring_canary_triggers_rollback() {
        let router = CanaryRouter::new(config(100.0)).unwrap();

        let mut rolled_back = 0;
        for _ in 0..100 {
            let cohort = router.assign("user:1");
            assert_eq!(cohort, Cohort::Canary);
            if router.record(cohort, Duration::from_millis(10), true) {
                rolled_back += 1;
            }
        }

        assert_eq!(rolled_back, 1);
        assert!(!router.is_active());
        assert_eq!(router.assign("user:1"), Cohort::Stable);
        assert_eq!(router.assign("user:someone-else"), Cohort::Stable);

        let reason = router.rollback_reason().unwrap();
        assert!(reason.contains("error rate"), "unexpected reason: {}", reason);
    }

    #[test]
    fn test_no_rollback_without_auto_rollback() {
        let router = CanaryRouter::new(CanaryConfig {
            auto_rollback: false,
            ..config(100.0)
        })
        .unwrap();

        for _ in 0..200 {
            router.record(Cohort::Canary, Duration::from_millis(10), true);
        }
        assert!(router.is_active());
    }

    #[test]
    fn test_stable_outcomes_never_trigger_rollback() {
        let router = CanaryRouter::new(config(50.0)).unwrap();

        for _ in 0..500 {
            router.record(Cohort::Stable, Duration::from_secs(10), true);
        }
        assert!(router.is_active());
    }

    #[test]
    fn test_snapshot_and_reset() {
        let router = CanaryRouter::new(config(50.0)).unwrap();
        router.record(Cohort::Canary, Duration::from_millis(200), false);
        router.record(Cohort::Canary, Duration::from_millis(400), true);
        router.record(Cohort::Stable, Duration::from_millis(100), false);

        let snapshot = router.snapshot();
        assert!(snapshot.active);
        assert_eq!(snapshot.version, "v2.0.0");
        assert_eq!(snapshot.canary.requests, 2);
        assert_eq!(snapshot.canary.errors, 1);
        assert_eq!(snapshot.canary.error_rate, 50.0);
        assert!((snapshot.canary.avg_latency_secs - 0.3).abs() < 1e-9);
        assert_eq!(snapshot.stable.requests, 1);
        assert!(snapshot.window_duration_secs >= 0.0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["canary"]["requests"], 2);
        assert_eq!(json["active"], true);

        router.reset_metrics();
        let reset = router.snapshot();
        assert_eq!(reset.canary.requests, 0);
        assert_eq!(reset.stable.requests, 0);
        assert!(reset.window_start >= snapshot.window_start);
    }

    #[test]
    fn test_concurrent_record_and_snapshot() {
        let router = Arc::new(CanaryRouter::new(CanaryConfig {
            auto_rollback: false,
            ..config(50.0)
        })
        .unwrap());

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let router = Arc::clone(&router);
                std::thread::spawn(move || {
                    for j in 0..250 {
                        let cohort = router.assign(&format!("user:{}:{}", i, j));
                        router.record(cohort, Duration::from_millis(5), false);
                        let _ = router.snapshot();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        let snapshot = router.snapshot();
        assert_eq!(snapshot.canary.requests + snapshot.stable.requests, 2000);
    }
}

//! Per-cohort request accumulators and their read model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cohort::Cohort;

/// Running totals for one cohort.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CohortMetrics {
    requests: u64,
    errors: u64,
    latency_sum: f64,
    latency_count: u64,
}

impl CohortMetrics {
    /// Add one completed request.
    pub fn record(&mut self, duration_secs: f64, is_error: bool) {
        self.requests += 1;
        if is_error {
            self.errors += 1;
        }
        if duration_secs.is_finite() && duration_secs >= 0.0 {
            self.latency_sum += duration_secs;
            self.latency_count += 1;
        }
    }

    /// Requests recorded.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Requests that ended in a server error.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Error rate in percent, 0 when nothing was recorded.
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.errors as f64 * 100.0 / self.requests as f64
    }

    /// Mean latency in seconds, 0 when nothing was recorded.
    pub fn avg_latency(&self) -> f64 {
        if self.latency_count == 0 {
            return 0.0;
        }
        self.latency_sum / self.latency_count as f64
    }

    /// Point-in-time view of these totals.
    pub fn snapshot(&self) -> CohortSnapshot {
        CohortSnapshot {
            requests: self.requests,
            errors: self.errors,
            error_rate: self.error_rate(),
            avg_latency_secs: self.avg_latency(),
        }
    }
}

/// Accumulators for both cohorts over one observation window.
#[derive(Debug, Clone, PartialEq)]
pub struct CanaryMetrics {
    canary: CohortMetrics,
    stable: CohortMetrics,
    window_start: DateTime<Utc>,
}

impl CanaryMetrics {
    /// Start an empty window now.
    pub fn new() -> Self {
        Self {
            canary: CohortMetrics::default(),
            stable: CohortMetrics::default(),
            window_start: Utc::now(),
        }
    }

    /// Record a completed request for `cohort`.
    pub fn record(&mut self, cohort: Cohort, duration_secs: f64, is_error: bool) {
        match cohort {
            Cohort::Canary => self.canary.record(duration_secs, is_error),
            Cohort::Stable => self.stable.record(duration_secs, is_error),
        }
    }

    /// Totals for one cohort.
    pub fn cohort(&self, cohort: Cohort) -> &CohortMetrics {
        match cohort {
            Cohort::Canary => &self.canary,
            Cohort::Stable => &self.stable,
        }
    }

    /// When the current window started.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }
}

impl Default for CanaryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Read model for one cohort.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CohortSnapshot {
    pub requests: u64,
    pub errors: u64,
    /// Percent
    pub error_rate: f64,
    pub avg_latency_secs: f64,
}

/// Read model for the whole router, as served by the admin API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub canary: CohortSnapshot,
    pub stable: CohortSnapshot,
    pub window_start: DateTime<Utc>,
    pub window_duration_secs: f64,
    pub active: bool,
    pub version: String,
    pub rollback_reason: Option<String>,
}

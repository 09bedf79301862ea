//! Canary deployment routing.
//!
//! Requests are split between a stable and a canary cohort by hashing the
//! client identity, so a given client sees the same version on every
//! request. Per-cohort error rate and latency are tracked and the canary is
//! switched off when it becomes unhealthy.

mod cohort;
mod config;
mod metrics;
mod middleware;
mod policy;
mod router;

pub use cohort::{assign_cohort, rollout_position, Cohort};
pub use config::CanaryConfig;
pub use metrics::{CanaryMetrics, CohortMetrics, CohortSnapshot, MetricsSnapshot};
pub use middleware::{canary_route, COHORT_HEADER, VERSION_HEADER};
pub use policy::{evaluate, RollbackTrigger, MIN_CANARY_REQUESTS};
pub use router::{CanaryRouter, STABLE_VERSION};

//! Deterministic cohort assignment.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// The traffic segment a request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cohort {
    /// The version being rolled out
    Canary,
    /// The current production version
    Stable,
}

impl Cohort {
    /// Label used in headers and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Cohort::Canary => "canary",
            Cohort::Stable => "stable",
        }
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an identity on the `[0, 100)` rollout scale.
///
/// The first eight bytes of the SHA-256 digest are read as a big-endian
/// integer, reduced modulo 10000 and divided by 100, giving two decimal
/// places of resolution.
pub fn rollout_position(identity: &str) -> f64 {
    let digest = Sha256::digest(identity.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 10_000) as f64 / 100.0
}

/// Assign an identity to a cohort for the given canary traffic share.
pub fn assign_cohort(identity: &str, traffic_percent: f64) -> Cohort {
    if rollout_position(identity) < traffic_percent {
        Cohort::Canary
    } else {
        Cohort::Stable
    }
}

//! Rate limit rules configuration and matching.
//!
//! A rules table maps request paths to rate limit policies. The longest
//! matching path prefix wins; requests matching no rule get the default
//! policy.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use super::counter::RateLimitConfig;
use super::key::KeyStrategy;
use crate::error::{Result, ScenegateError};

/// Name reported for requests that match no rule.
pub const DEFAULT_RULE_NAME: &str = "default";

/// A limit together with the way requests are keyed against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// The limit to enforce
    #[serde(flatten)]
    pub limit: RateLimitConfig,
    /// How requests are mapped to keys
    #[serde(default)]
    pub key: KeyStrategy,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: RateLimitConfig::default(),
            key: KeyStrategy::Ip,
        }
    }
}

/// A policy applied to every path starting with `path_prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Name used to namespace this rule's buckets
    pub name: String,
    /// Path prefix the rule applies to
    pub path_prefix: String,
    /// The policy to apply
    #[serde(flatten)]
    pub policy: RateLimitPolicy,
}

/// A complete rules table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Policy for requests that match no rule
    #[serde(default)]
    pub default: RateLimitPolicy,
    /// Route-specific rules
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

impl RateLimitRules {
    /// Create a table with only a default policy.
    pub fn new(default: RateLimitPolicy) -> Self {
        Self {
            default,
            rules: Vec::new(),
        }
    }

    /// Add a rule.
    pub fn with_rule(mut self, name: &str, path_prefix: &str, policy: RateLimitPolicy) -> Self {
        self.rules.push(RateLimitRule {
            name: name.to_string(),
            path_prefix: path_prefix.to_string(),
            policy,
        });
        self
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml).map_err(|e| {
            ScenegateError::Config(format!("Failed to parse rate limit rules: {}", e))
        })?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check rule names and prefixes.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for rule in &self.rules {
            if rule.name.is_empty() || rule.name == DEFAULT_RULE_NAME {
                return Err(ScenegateError::Config(format!(
                    "invalid rate limit rule name '{}'",
                    rule.name
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ScenegateError::Config(format!(
                    "duplicate rate limit rule '{}'",
                    rule.name
                )));
            }
            if !rule.path_prefix.starts_with('/') {
                return Err(ScenegateError::Config(format!(
                    "rate limit rule '{}' path_prefix must start with '/'",
                    rule.name
                )));
            }
        }
        Ok(())
    }

    /// Find the policy for a request path and the name of the rule that supplied it.
    pub fn policy_for(&self, path: &str) -> (&str, &RateLimitPolicy) {
        self.rules
            .iter()
            .filter(|rule| path.starts_with(&rule.path_prefix))
            .max_by_key(|rule| rule.path_prefix.len())
            .map(|rule| (rule.name.as_str(), &rule.policy))
            .unwrap_or((DEFAULT_RULE_NAME, &self.default))
    }
}

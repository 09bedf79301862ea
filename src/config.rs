//! Configuration management for Scenegate.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! environment variables prefixed with `SCENEGATE__`, using `__` to separate
//! nested keys (`SCENEGATE__CANARY__TRAFFIC_PERCENT=10`).

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::canary::CanaryConfig;
use crate::error::{Result, ScenegateError};
use crate::idempotency::IdempotencyConfig;
use crate::ratelimit::{RateLimitPolicy, RateLimitRule, RateLimitRules};

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "SCENEGATE";

/// Separator between the prefix and nested keys of environment overrides.
pub const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Scenegate service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Canary rollout configuration
    #[serde(default)]
    pub canary: CanaryConfig,

    /// Idempotency key configuration
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Application listener address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Admin listener address
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// Where rate limit counters live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Fixed-window counters in this process
    #[default]
    Memory,
    /// Sliding-window counters in a shared Redis
    Redis,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Counter backend
    #[serde(default)]
    pub backend: BackendKind,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Deadline for one shared-cache call, in milliseconds
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Extra lifetime given to shared-cache keys beyond the window, in seconds
    #[serde(default = "default_expiry_buffer_secs")]
    pub expiry_buffer_secs: u64,

    /// Interval between sweeps of expired in-process buckets, in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Path to a YAML rules file; replaces `default` and `rules` when set
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Policy for requests that match no rule
    #[serde(default)]
    pub default: RateLimitPolicy,

    /// Route-specific rules
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            redis_url: None,
            backend_timeout_ms: default_backend_timeout_ms(),
            expiry_buffer_secs: default_expiry_buffer_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            rules_path: None,
            default: RateLimitPolicy::default(),
            rules: Vec::new(),
        }
    }
}

fn default_backend_timeout_ms() -> u64 {
    50
}

fn default_expiry_buffer_secs() -> u64 {
    1
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

impl RateLimitingConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn expiry_buffer(&self) -> Duration {
        Duration::from_secs(self.expiry_buffer_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Build the rules table, reading `rules_path` if it is set.
    pub fn load_rules(&self) -> Result<RateLimitRules> {
        if let Some(path) = &self.rules_path {
            return RateLimitRules::from_file(path);
        }

        let rules = RateLimitRules {
            default: self.default,
            rules: self.rules.clone(),
        };
        rules.validate()?;
        Ok(rules)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend_timeout_ms == 0 {
            return Err(ScenegateError::Config(
                "rate_limiting.backend_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ScenegateError::Config(
                "rate_limiting.cleanup_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.backend == BackendKind::Redis && self.redis_url.is_none() {
            return Err(ScenegateError::Config(
                "rate_limiting.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.rules_path.is_none() {
            self.load_rules()?;
        }
        Ok(())
    }
}

impl GatewayConfig {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        Self::from_builder(builder.add_source(environment()))
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_builder(config::Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)))
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: GatewayConfig = builder
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| ScenegateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        if self.server.http_addr == self.server.admin_addr {
            return Err(ScenegateError::Config(format!(
                "server.http_addr and server.admin_addr must differ, both are {}",
                self.server.http_addr
            )));
        }
        self.rate_limiting.validate()?;
        self.canary.validate()?;
        self.idempotency.validate()?;
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("idempotency.protected_routes")
}

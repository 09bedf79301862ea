//! Idempotency decision logic.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::key::DEFAULT_MAX_KEY_LENGTH;
use super::record::{IdempotencyRecord, RecordStatus};
use super::store::{IdempotencyStore, InsertOutcome, StoreError};
use crate::error::{Result, ScenegateError};

/// Which requests are governed and how keys are validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Routes whose POST requests require an idempotency key
    #[serde(default)]
    pub protected_routes: Vec<String>,

    /// Longest accepted key, in characters
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,

    /// How long records are kept, in seconds
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Largest response body captured for replay, in bytes. Bigger responses
    /// are passed through and not cached.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            protected_routes: Vec::new(),
            max_key_length: default_max_key_length(),
            retention_secs: default_retention_secs(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

fn default_max_key_length() -> usize {
    DEFAULT_MAX_KEY_LENGTH
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_response_bytes() -> usize {
    1024 * 1024
}

impl IdempotencyConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_key_length == 0 {
            return Err(ScenegateError::Config(
                "idempotency max_key_length must be greater than 0".to_string(),
            ));
        }
        if self.retention_secs == 0 {
            return Err(ScenegateError::Config(
                "idempotency retention_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_response_bytes == 0 {
            return Err(ScenegateError::Config(
                "idempotency max_response_bytes must be greater than 0".to_string(),
            ));
        }
        if let Some(route) = self.protected_routes.iter().find(|r| !r.starts_with('/')) {
            return Err(ScenegateError::Config(format!(
                "idempotency protected route '{}' must start with '/'",
                route
            )));
        }
        Ok(())
    }
}

/// What to do with a request carrying a valid key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    /// First use of the key. The key is reserved; run the handler and report
    /// the result through [`IdempotencyCache::complete`].
    Execute,
    /// The key completed before; replay the captured response
    Replay(IdempotencyRecord),
    /// A request with this key is still being handled
    InProgress,
    /// The key was first used for a different operation
    KeyReused,
}

/// Grants each idempotency key at most one successful execution.
pub struct IdempotencyCache {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
    executions: AtomicU64,
    replays: AtomicU64,
}

impl IdempotencyCache {
    /// Create a cache over `store`.
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            executions: AtomicU64::new(0),
            replays: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Whether a request to this route with this method is governed.
    ///
    /// `route` is checked alongside the matched route template, if any, so a
    /// protected route may be configured either way.
    pub fn is_protected(&self, method: &str, route: &str, template: Option<&str>) -> bool {
        method.eq_ignore_ascii_case("POST")
            && self
                .config
                .protected_routes
                .iter()
                .any(|protected| protected == route || Some(protected.as_str()) == template)
    }

    /// Reserve `key` or find out why it cannot run.
    pub async fn begin(
        &self,
        key: &str,
        method: &str,
        route: &str,
    ) -> std::result::Result<IdempotencyOutcome, StoreError> {
        let reservation = IdempotencyRecord::processing(key, method, route);

        let existing = match self.store.insert_if_absent(reservation).await? {
            InsertOutcome::Inserted => {
                self.executions.fetch_add(1, Ordering::Relaxed);
                return Ok(IdempotencyOutcome::Execute);
            }
            InsertOutcome::Exists(existing) => existing,
        };

        if !existing.matches(method, route) {
            debug!(
                key = %key,
                route = %route,
                original_route = %existing.route,
                "Idempotency key reused for a different operation"
            );
            return Ok(IdempotencyOutcome::KeyReused);
        }

        match existing.status {
            RecordStatus::Processing => {
                debug!(key = %key, "Idempotent request already in progress");
                Ok(IdempotencyOutcome::InProgress)
            }
            RecordStatus::Completed => {
                self.replays.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, status = existing.response_status_code, "Replaying idempotent response");
                Ok(IdempotencyOutcome::Replay(existing))
            }
        }
    }

    /// Record the handler's response for a reserved key.
    ///
    /// A 2xx response is persisted for replay. Anything else releases the
    /// reservation so the client can retry with the same key.
    pub async fn complete(
        &self,
        key: &str,
        method: &str,
        route: &str,
        status_code: u16,
        body: Vec<u8>,
    ) -> std::result::Result<(), StoreError> {
        if !(200..300).contains(&status_code) {
            debug!(key = %key, status = status_code, "Not caching unsuccessful response");
            return self.store.remove(key).await;
        }

        let record = IdempotencyRecord::processing(key, method, route).complete(status_code, body);
        self.store.store(record).await
    }

    /// Give up a reservation without storing a response.
    pub async fn release(&self, key: &str) {
        if let Err(e) = self.store.remove(key).await {
            error!(key = %key, error = %e, "Failed to release idempotency reservation");
        }
    }

    /// Release `key` if it is still only reserved.
    ///
    /// A completed record is left alone, so an abandoned request cannot wipe
    /// out a response that was already stored.
    pub async fn abandon(&self, key: &str) {
        match self.store.get(key).await {
            Ok(record) if record.status == RecordStatus::Processing => {
                warn!(key = %key, "Idempotent request abandoned, releasing key");
                self.release(key).await;
            }
            Ok(_) | Err(StoreError::NotFound) => {}
            Err(e) => {
                error!(key = %key, error = %e, "Failed to look up abandoned idempotency key");
            }
        }
    }

    /// Requests that ran the handler.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Requests answered from a stored response.
    pub fn replays(&self) -> u64 {
        self.replays.load(Ordering::Relaxed)
    }
}

/// A reserved key that is released if the request never finishes.
///
/// Dropping an armed guard (the request future was cancelled, timed out or
/// panicked) spawns [`IdempotencyCache::abandon`] on the current runtime so a
/// retry with the same key can run. Call [`Reservation::disarm`] once the
/// outcome has been recorded.
pub struct Reservation {
    cache: Arc<IdempotencyCache>,
    key: Option<String>,
}

impl Reservation {
    pub fn new(cache: Arc<IdempotencyCache>, key: impl Into<String>) -> Self {
        Self {
            cache,
            key: Some(key.into()),
        }
    }

    /// Stop the guard from releasing the key.
    pub fn disarm(mut self) {
        self.key = None;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let cache = Arc::clone(&self.cache);
                handle.spawn(async move {
                    cache.abandon(&key).await;
                });
            }
            Err(_) => {
                warn!(key = %key, "Idempotency reservation dropped outside a runtime, key stays reserved");
            }
        }
    }
}

//! Idempotency record storage.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::record::IdempotencyRecord;
use crate::error::ScenegateError;

/// Store failures. A missing record is reported separately from a broken
/// backend so callers never mistake an outage for a first request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("idempotency record not found")]
    NotFound,

    #[error("{0}")]
    Backend(String),
}

impl From<StoreError> for ScenegateError {
    fn from(err: StoreError) -> Self {
        ScenegateError::IdempotencyStore(err.to_string())
    }
}

/// Result of an atomic insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The record was stored
    Inserted,
    /// A record already existed under the key and was left untouched
    Exists(IdempotencyRecord),
}

/// Storage for idempotency records.
///
/// Implementations must make `insert_if_absent` atomic with respect to every
/// other operation on the same key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Look up the record for `key`.
    async fn get(&self, key: &str) -> Result<IdempotencyRecord, StoreError>;

    /// Write `record`, replacing any record under the same key.
    async fn store(&self, record: IdempotencyRecord) -> Result<(), StoreError>;

    /// Write `record` only if its key is unused.
    async fn insert_if_absent(&self, record: IdempotencyRecord)
        -> Result<InsertOutcome, StoreError>;

    /// Delete the record for `key`, if any.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Single-process record store.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop records created more than `age` ago. Returns how many were removed.
    pub fn purge_older_than(&self, age: Duration) -> usize {
        // An age beyond the representable range keeps everything.
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));

        let mut records = self.records.write();
        let before = records.len();
        if let Some(cutoff) = cutoff {
            records.retain(|_, record| record.created_at > cutoff);
        }
        let removed = before - records.len();

        if removed > 0 {
            debug!(removed = removed, "Purged idempotency records");
        }
        removed
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<IdempotencyRecord, StoreError> {
        self.records
            .read()
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn store(&self, record: IdempotencyRecord) -> Result<(), StoreError> {
        self.records.write().insert(record.key.clone(), record);
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<InsertOutcome, StoreError> {
        match self.records.write().entry(record.key.clone()) {
            Entry::Occupied(existing) => Ok(InsertOutcome::Exists(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.records.write().remove(key);
        Ok(())
    }
}

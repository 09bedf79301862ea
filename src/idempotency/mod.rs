//! Idempotency keys for non-idempotent operations.
//!
//! POST requests to protected routes must carry an `Idempotency-Key` header.
//! The first request with a key runs the handler; a successful response is
//! captured and replayed verbatim for every later request with that key.

mod cache;
mod key;
mod middleware;
mod record;
mod store;

pub use cache::{IdempotencyCache, IdempotencyConfig, IdempotencyOutcome, Reservation};
pub use key::{
    extract_key, validate_key, IdempotencyKeyError, DEFAULT_MAX_KEY_LENGTH, IDEMPOTENCY_KEY_HEADER,
};
pub use middleware::{idempotency, REPLAYED_HEADER};
pub use record::{response_hash, IdempotencyRecord, RecordStatus};
pub use store::{IdempotencyStore, InMemoryIdempotencyStore, InsertOutcome, StoreError};

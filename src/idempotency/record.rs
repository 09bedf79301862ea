//! Stored idempotency records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// The first request with this key is still being handled
    Processing,
    /// A successful response was captured
    Completed,
}

/// The outcome of the first request made with an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub method: String,
    pub route: String,
    /// Hex SHA-256 of `response_body`, empty while processing
    pub response_hash: String,
    pub status: RecordStatus,
    pub response_body: Vec<u8>,
    pub response_status_code: u16,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Reservation placed before the handler runs.
    pub fn processing(key: &str, method: &str, route: &str) -> Self {
        Self {
            key: key.to_string(),
            method: method.to_string(),
            route: route.to_string(),
            response_hash: String::new(),
            status: RecordStatus::Processing,
            response_body: Vec::new(),
            response_status_code: 0,
            created_at: Utc::now(),
        }
    }

    /// Turn a reservation into a completed record holding the response.
    pub fn complete(mut self, status_code: u16, body: Vec<u8>) -> Self {
        self.response_hash = response_hash(&body);
        self.response_status_code = status_code;
        self.response_body = body;
        self.status = RecordStatus::Completed;
        self
    }

    /// Whether the record was created by a request to the same operation.
    pub fn matches(&self, method: &str, route: &str) -> bool {
        self.method.eq_ignore_ascii_case(method) && self.route == route
    }

    pub fn is_completed(&self) -> bool {
        self.status == RecordStatus::Completed
    }
}

/// Hex SHA-256 of a response body.
pub fn response_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_then_completion() {
        let record = IdempotencyRecord::processing("k1", "POST", "/api/payments");
        assert_eq!(record.status, RecordStatus::Processing);
        assert!(!record.is_completed());
        assert!(record.response_hash.is_empty());

        let created_at = record.created_at;
        let record = record.complete(201, br#"{"id":1}"#.to_vec());

        assert!(record.is_completed());
        assert_eq!(record.response_status_code, 201);
        assert_eq!(record.response_body, br#"{"id":1}"#.to_vec());
        assert_eq!(record.response_hash, response_hash(br#"{"id":1}"#));
        assert_eq!(record.created_at, created_at);
    }

    #[test]
    fn test_response_hash_is_sha256_hex() {
        assert_eq!(
            response_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_matches_operation() {
        let record = IdempotencyRecord::processing("k1", "POST", "/api/payments");
        assert!(record.matches("post", "/api/payments"));
        assert!(!record.matches("POST", "/api/orders"));
        assert!(!record.matches("PUT", "/api/payments"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let record = IdempotencyRecord::processing("k1", "POST", "/r");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "processing");
    }
}

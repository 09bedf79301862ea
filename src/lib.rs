//! Scenegate - Request Governance Middleware
//!
//! This crate implements three pieces of HTTP middleware for axum services:
//! rate limiting (in-process fixed window or a Redis-backed sliding window
//! that fails open), canary routing with automatic rollback, and
//! idempotency keys that replay the first successful response.

pub mod canary;
pub mod config;
pub mod error;
pub mod http;
pub mod idempotency;
pub mod ratelimit;

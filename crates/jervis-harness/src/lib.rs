//! Reliability and safety infrastructure shared by the Jervis daemon's
//! background loops.
//!
//! This crate sits between the ingestion/orchestration logic in
//! `jervis-daemon` and the external systems it talks to. It provides:
//! - Per-domain rate limiting for outbound source-API calls
//! - A circuit breaker for tolerating planner/source outages without
//!   flooding them with retries
//! - The link safety qualifier that decides whether a discovered URL may be
//!   fetched by the indexer
//! - Cooperative shutdown coordination for the supervisor's managed loops

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod security;
pub mod shutdown;

//! Telemetry and observability infrastructure for the daemon.
//!
//! This crate provides a unified observability layer combining logging, metrics,
//! and distributed tracing. It integrates with the `tracing` ecosystem for
//! structured logging and spans, exposes Prometheus-compatible metrics, and
//! provides OpenTelemetry-compatible trace/span ID generation for correlating
//! a poll, an index pass, and the background task it triggers.
//!
//! Key components:
//! - **Logging**: Human-readable and JSON-formatted output via `tracing-subscriber`
//! - **Metrics**: Thread-safe counters, gauges, and histograms with Prometheus export
//! - **Tracing**: OpenTelemetry-compatible trace/span ID generation and correlation

pub mod logging;
pub mod metrics;
pub mod tracing_setup;

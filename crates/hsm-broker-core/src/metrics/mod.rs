//! Metrics collection for the HSM broker.
//!
//! Provides Prometheus-compatible metrics for request outcomes, latency,
//! in-flight work and connection health.

pub mod prometheus;

pub use prometheus::BrokerMetrics;

//! Prometheus metrics for the broker.
//!
//! Metrics live on a private registry owned by [`BrokerMetrics`], so several
//! brokers in one process never clash on registration.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Broker metrics collection.
pub struct BrokerMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Completed requests by outcome (`ok` or an error kind).
    pub requests_total: IntCounterVec,

    /// Request latency from `send` to resolution, by outcome.
    pub request_duration_seconds: HistogramVec,

    /// Requests registered with a worker and awaiting a response.
    pub pending_requests: IntGauge,

    /// Device connections currently alive in the pool.
    pub pool_connections: IntGauge,

    /// Responses whose correlation id matched no pending request.
    pub unmatched_responses: IntCounter,

    /// Connection failures by stage (`acquire`, `write`, `read`).
    pub connection_failures: IntCounterVec,
}

impl BrokerMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        Self::try_new().expect("metric registration should succeed")
    }

    /// Create a new metrics collection, reporting registration failures.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric cannot be created or registered.
    pub fn try_new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "hsm_broker_requests_total",
                "Total number of requests by outcome",
            ),
            &["outcome"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "hsm_broker_request_duration_seconds",
                "Request latency in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["outcome"],
        )?;

        let pending_requests = IntGauge::new(
            "hsm_broker_pending_requests",
            "Requests dispatched to a worker and awaiting a response",
        )?;

        let pool_connections = IntGauge::new(
            "hsm_broker_pool_connections",
            "Device connections currently held by the pool",
        )?;

        let unmatched_responses = IntCounter::new(
            "hsm_broker_unmatched_responses_total",
            "Responses whose correlation id matched no pending request",
        )?;

        let connection_failures = IntCounterVec::new(
            Opts::new(
                "hsm_broker_connection_failures_total",
                "Device connection failures by stage",
            ),
            &["stage"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(pending_requests.clone()))?;
        registry.register(Box::new(pool_connections.clone()))?;
        registry.register(Box::new(unmatched_responses.clone()))?;
        registry.register(Box::new(connection_failures.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            pending_requests,
            pool_connections,
            unmatched_responses,
            connection_failures,
        })
    }

    /// Record a finished request.
    pub fn record_request(&self, outcome: &str, duration_seconds: f64) {
        self.requests_total.with_label_values(&[outcome]).inc();
        self.request_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration_seconds);
    }

    /// Set the number of pending requests.
    pub fn set_pending(&self, count: usize) {
        self.pending_requests.set(count as i64);
    }

    /// Set the number of live pool connections.
    pub fn set_pool_connections(&self, count: usize) {
        self.pool_connections.set(count as i64);
    }

    /// Record a response whose correlation id matched no pending request.
    pub fn record_unmatched_response(&self) {
        self.unmatched_responses.inc();
    }

    /// Record a connection failure at `stage`.
    pub fn record_connection_failure(&self, stage: &str) {
        self.connection_failures.with_label_values(&[stage]).inc();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BrokerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = BrokerMetrics::new();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_two_collections_do_not_clash() {
        let a = BrokerMetrics::new();
        let b = BrokerMetrics::new();
        a.record_unmatched_response();
        assert_eq!(a.unmatched_responses.get(), 1);
        assert_eq!(b.unmatched_responses.get(), 0);
    }

    #[test]
    fn test_record_request() {
        let metrics = BrokerMetrics::new();
        metrics.record_request("ok", 0.002);
        metrics.record_request("ok", 0.003);
        metrics.record_request("timeout", 5.0);

        assert_eq!(metrics.requests_total.with_label_values(&["ok"]).get(), 2);
        let output = metrics.encode().unwrap();
        assert!(output.contains("hsm_broker_requests_total"));
        assert!(output.contains("hsm_broker_request_duration_seconds"));
    }

    #[test]
    fn test_gauges() {
        let metrics = BrokerMetrics::new();
        metrics.set_pending(3);
        metrics.set_pool_connections(2);

        assert_eq!(metrics.pending_requests.get(), 3);
        assert_eq!(metrics.pool_connections.get(), 2);
    }

    #[test]
    fn test_connection_failures() {
        let metrics = BrokerMetrics::new();
        metrics.record_connection_failure("write");

        let output = metrics.encode().unwrap();
        assert!(output.contains("hsm_broker_connection_failures_total"));
        assert!(output.contains("stage=\"write\""));
    }
}

//! Test harness for integration testing of the broker.
//!
//! Provides a complete test environment with:
//! - Mock device
//! - Connection pool and broker with running workers
//! - Helper methods for sending requests and inspecting what the device saw

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::error::Result;
use crate::hsm::{PinKeys, PinService};
use crate::metrics::BrokerMetrics;
use crate::pool::{tcp_factory, ConnectionPool, DeviceConnection};

use super::mock_device::{DeviceCall, MockDevice, Responder};

/// Test harness for integration testing.
pub struct BrokerTestHarness {
    /// The mock device
    device: MockDevice,
    /// The broker, connected to the mock device
    pub broker: Broker<DeviceConnection>,
    /// Metrics the broker records into
    pub metrics: Arc<BrokerMetrics>,
    token: CancellationToken,
    workers: Option<JoinHandle<()>>,
}

impl BrokerTestHarness {
    /// Create a new test harness with default configuration.
    ///
    /// Default config: pool capacity 2, 2 workers, 1 second request timeout.
    pub async fn new() -> Self {
        TestHarnessBuilder::new().build().await
    }

    /// Get the mock device address.
    #[must_use]
    pub fn device_address(&self) -> &str {
        self.device.address()
    }

    /// The mock device.
    #[must_use]
    pub fn device(&self) -> &MockDevice {
        &self.device
    }

    /// Replace the mock device's responder.
    pub async fn set_responder(&self, responder: Responder) {
        self.device.set_responder(responder).await;
    }

    /// Get all recorded device calls.
    pub async fn device_calls(&self) -> Vec<DeviceCall> {
        self.device.get_calls().await
    }

    /// Get device calls filtered by command code.
    pub async fn device_calls_for_command(&self, code: &str) -> Vec<DeviceCall> {
        self.device.get_calls_for_command(code).await
    }

    /// Send a request through the broker.
    pub async fn send(&self, request: impl Into<Bytes>) -> Result<Bytes> {
        self.broker.send(request).await
    }

    /// A PIN service sharing the harness broker.
    #[must_use]
    pub fn pin_service(&self, keys: PinKeys) -> PinService<DeviceConnection> {
        PinService::new(self.broker.clone(), keys)
    }

    /// Close the broker, stop the device and wait for the workers.
    ///
    /// The device goes down before the workers are awaited so that a worker
    /// blocked reading from a silent device sees its connection close.
    pub async fn shutdown(&mut self) {
        self.broker.close().await;
        self.token.cancel();
        self.device.stop().await;
        if let Some(workers) = self.workers.take() {
            let _ = workers.await;
        }
    }
}

/// Builder for creating test harness with specific configuration.
pub struct TestHarnessBuilder {
    pool_capacity: usize,
    workers: usize,
    request_timeout: Duration,
    responder: Option<Responder>,
}

impl TestHarnessBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool_capacity: 2,
            workers: 2,
            request_timeout: Duration::from_secs(1),
            responder: None,
        }
    }

    /// Set the pool capacity.
    #[must_use]
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Set the number of broker workers.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Install a responder on the mock device before the broker starts.
    #[must_use]
    pub fn responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Build the test harness.
    ///
    /// # Panics
    ///
    /// Panics if the mock device cannot bind a local port.
    pub async fn build(self) -> BrokerTestHarness {
        let mut device = MockDevice::new("127.0.0.1:0");
        let address = device
            .start()
            .await
            .expect("Failed to start mock device");
        if let Some(responder) = self.responder {
            device.set_responder(responder).await;
        }

        let pool = Arc::new(ConnectionPool::new(
            self.pool_capacity,
            tcp_factory(address, Duration::from_secs(1)),
        ));
        let metrics = Arc::new(BrokerMetrics::new());
        let broker = Broker::builder(pool)
            .workers(self.workers)
            .request_timeout(self.request_timeout)
            .metrics(Arc::clone(&metrics))
            .build();

        let token = CancellationToken::new();
        let workers = {
            let broker = broker.clone();
            let token = token.clone();
            tokio::spawn(async move { broker.start(token).await })
        };

        BrokerTestHarness {
            device,
            broker,
            metrics,
            token,
            workers: Some(workers),
        }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

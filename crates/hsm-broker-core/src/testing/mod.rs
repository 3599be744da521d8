//! Test utilities for the HSM broker.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockDevice`] - A mock device speaking the length-prefixed framing
//! - [`BrokerTestHarness`] - A running broker wired to a mock device
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//!
//! # Example
//!
//! ```rust,ignore
//! use hsm_broker_core::testing::BrokerTestHarness;
//!
//! #[tokio::test]
//! async fn test_diagnostics() {
//!     let harness = BrokerTestHarness::new().await;
//!
//!     let response = harness.send(&b"NC"[..]).await.unwrap();
//!     assert_eq!(&response[..], b"ND00");
//!
//!     let calls = harness.device_calls_for_command("NC").await;
//!     assert_eq!(calls.len(), 1);
//! }
//! ```

pub mod harness;
pub mod mock_device;

pub use harness::{BrokerTestHarness, TestHarnessBuilder};
pub use mock_device::{responses, DeviceCall, MockDevice, Reply, Responder};

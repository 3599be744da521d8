//! HSM Broker Core Library
//!
//! This library lets many concurrent callers run request/response
//! transactions against a payment HSM reachable over a handful of persistent
//! TCP connections speaking a 2-byte length-prefixed framing.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Frame codec and correlation ids
//! - [`pool`] - Bounded, lazily filled connection pool
//! - [`broker`] - Request queue, workers and response demultiplexing
//! - [`hsm`] - Device commands built on top of the broker
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hsm_broker_core::{config::Config, pool::{tcp_factory, ConnectionPool}, Broker};
//!
//! let config = Config::from_file("config.yaml")?;
//! let pool = Arc::new(ConnectionPool::new(
//!     config.pool.capacity,
//!     tcp_factory(config.device.address.clone(), config.device.connect_timeout()),
//! ));
//! let broker = Broker::builder(pool).config(&config.broker).build();
//!
//! tokio::spawn({
//!     let broker = broker.clone();
//!     async move { broker.start(CancellationToken::new()).await }
//! });
//! let response = broker.send(&b"NC"[..]).await?;
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod error;
pub mod hsm;
pub mod metrics;
pub mod pool;
pub mod protocol;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use broker::{Broker, BrokerBuilder};
pub use config::Config;
pub use error::{BrokerError, ConfigError, ConfigResult, Result};
pub use hsm::{HsmError, PinService};
pub use metrics::BrokerMetrics;
pub use pool::{ConnectionPool, DeviceConnection, PoolItem};

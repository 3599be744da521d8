//! Connection pooling.
//!
//! This module provides:
//! - A bounded, lazily filled pool of reusable resources
//! - The capability contract pooled resources implement
//! - Buffered TCP connections to the device and a factory for them

pub mod connection_pool;
pub mod device;
pub mod item;

pub use connection_pool::ConnectionPool;
pub use device::{tcp_factory, DeviceConnection, DEFAULT_CONNECT_TIMEOUT};
pub use item::{Factory, PoolItem};

//! Request/response brokering.
//!
//! This module provides:
//! - The [`Broker`] handle callers send requests through
//! - Worker tasks that carry each request over a pooled connection
//! - The pending table that routes responses back by correlation id

pub mod client;
pub mod pending;
mod worker;

pub use client::{Broker, BrokerBuilder, DEFAULT_REQUEST_TIMEOUT, DEFAULT_WORKERS};
pub use pending::{PendingTable, Registration, Task};

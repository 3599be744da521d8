//! HSM command layer.
//!
//! The broker moves opaque bytes. This module builds device commands and
//! interprets their responses.

pub mod command;
pub mod response;

pub use command::{diagnostics, PinKeys, PinService, PinVerification};
pub use response::{ErrorCode, HsmError, HsmResponse};

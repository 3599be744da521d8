//! Wire protocol for the device link.
//!
//! This module provides:
//! - Frame codec for the 2-byte length prefix
//! - Correlation ids carried at the head of every frame body

pub mod codec;
pub mod correlation;

pub use codec::{FrameCodec, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};
pub use correlation::{CorrelationId, CorrelationIdGenerator, CORRELATION_ID_LEN};

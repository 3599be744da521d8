//! Correlation ids.
//!
//! Each request body starts with a 4-byte id that the device copies into its
//! response. Ids are produced by a counter rendered in base 62, so two live
//! requests only share an id if more than 62^4 are in flight.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

/// Length of a correlation id on the wire.
pub const CORRELATION_ID_LEN: usize = 4;

const ALPHABET: &[u8; 62] = b"1234567890abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Number of distinct generated ids (62^4).
pub const ID_SPACE: u32 = 62 * 62 * 62 * 62;

/// A 4-byte request/response correlation id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId([u8; CORRELATION_ID_LEN]);

impl CorrelationId {
    /// Render a counter value as a base-62 id. Values wrap at [`ID_SPACE`].
    #[must_use]
    pub fn from_index(index: u32) -> Self {
        let mut n = index % ID_SPACE;
        let mut bytes = [0u8; CORRELATION_ID_LEN];
        for slot in bytes.iter_mut().rev() {
            *slot = ALPHABET[(n % 62) as usize];
            n /= 62;
        }
        Self(bytes)
    }

    /// Take the id from the head of a response body.
    ///
    /// Returns `None` if the body is shorter than an id.
    #[must_use]
    pub fn from_prefix(body: &[u8]) -> Option<Self> {
        let head = body.get(..CORRELATION_ID_LEN)?;
        let mut bytes = [0u8; CORRELATION_ID_LEN];
        bytes.copy_from_slice(head);
        Some(Self(bytes))
    }

    /// Raw id bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; CORRELATION_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({self})")
    }
}

/// Hands out correlation ids in sequence.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    next: AtomicU32,
}

impl CorrelationIdGenerator {
    /// Create a generator starting at a random point of the id space.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(rand::thread_rng().gen_range(0..ID_SPACE))
    }

    /// Create a generator starting at a fixed index.
    #[must_use]
    pub fn starting_at(index: u32) -> Self {
        Self {
            next: AtomicU32::new(index % ID_SPACE),
        }
    }

    /// Generate the next id.
    pub fn next_id(&self) -> CorrelationId {
        let index = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some((n + 1) % ID_SPACE)
            })
            .unwrap_or_else(|n| n);
        CorrelationId::from_index(index)
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

//! Length-prefixed frame codec.
//!
//! Every message on the device link is framed as:
//! - 2 bytes: body length (big-endian, excludes these 2 bytes)
//! - N bytes: body
//!
//! The free functions serve the broker's one-request-one-response exchange.
//! [`FrameCodec`] implements tokio's `Decoder` and `Encoder` traits for the
//! same framing, for use with `Framed` streams.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{BrokerError, Result};

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Largest body a frame may carry.
///
/// Devices read the prefix as a signed 16-bit integer, so the upper half of
/// the `u16` range is never used.
pub const MAX_FRAME_LEN: usize = i16::MAX as usize;

/// Frame a payload.
///
/// # Errors
///
/// Returns [`BrokerError::PayloadTooLarge`] if the payload exceeds [`MAX_FRAME_LEN`].
pub fn encode(payload: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    encode_into(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Frame a payload, appending it to `dst`.
///
/// # Errors
///
/// Returns [`BrokerError::PayloadTooLarge`] if the payload exceeds [`MAX_FRAME_LEN`].
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    check_len(payload.len())?;
    dst.reserve(LENGTH_PREFIX_LEN + payload.len());
    dst.put_u16(payload.len() as u16);
    dst.extend_from_slice(payload);
    Ok(())
}

/// Decode one frame from a complete in-memory buffer.
///
/// Bytes after the first frame are ignored.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidMsgLength`] if the buffer holds fewer bytes
/// than the prefix declares, or is too short to hold a prefix at all.
pub fn decode(src: &[u8]) -> Result<Bytes> {
    if src.len() < LENGTH_PREFIX_LEN {
        return Err(BrokerError::InvalidMsgLength {
            declared: LENGTH_PREFIX_LEN,
            available: src.len(),
        });
    }

    let declared = u16::from_be_bytes([src[0], src[1]]) as usize;
    let available = src.len() - LENGTH_PREFIX_LEN;
    if available < declared {
        return Err(BrokerError::InvalidMsgLength {
            declared,
            available,
        });
    }

    Ok(Bytes::copy_from_slice(
        &src[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + declared],
    ))
}

/// Read exactly one frame from `reader`.
///
/// Waits until the whole body has arrived rather than judging by what is
/// currently buffered.
///
/// # Errors
///
/// Returns [`BrokerError::Connection`] if the stream fails or ends before the
/// prefix, and [`BrokerError::InvalidMsgLength`] if it ends inside the body.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let declared = reader.read_u16().await? as usize;

    let mut body = BytesMut::zeroed(declared);
    let mut filled = 0;
    while filled < declared {
        let n = reader.read(&mut body[filled..]).await?;
        if n == 0 {
            return Err(BrokerError::InvalidMsgLength {
                declared,
                available: filled,
            });
        }
        filled += n;
    }

    Ok(body.freeze())
}

/// Frame `payload` and write it to `writer`, flushing afterwards.
///
/// # Errors
///
/// Returns an error if the payload is too large or the write fails.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(BrokerError::PayloadTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// Codec for the 2-byte length-prefixed framing.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Create a new codec accepting frames up to [`MAX_FRAME_LEN`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Create a new codec with a smaller maximum frame length.
    #[must_use]
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(MAX_FRAME_LEN),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        // Read length without consuming
        let length = u16::from_be_bytes([src[0], src[1]]) as usize;

        if length > self.max_frame_len {
            return Err(BrokerError::PayloadTooLarge {
                len: length,
                max: self.max_frame_len,
            });
        }

        if src.len() < LENGTH_PREFIX_LEN + length {
            src.reserve(LENGTH_PREFIX_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = BrokerError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_len {
            return Err(BrokerError::PayloadTooLarge {
                len: item.len(),
                max: self.max_frame_len,
            });
        }
        encode_into(&item, dst)
    }
}


/// Property-based tests for the frame codec
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Round-trip property: decode(encode(p)) == p
        #[test]
        fn prop_encode_decode_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..=2048)) {
            let frame = encode(&payload).unwrap();
            prop_assert_eq!(frame.len(), payload.len() + LENGTH_PREFIX_LEN);
            let decoded = decode(&frame).unwrap();
            prop_assert_eq!(&decoded[..], &payload[..]);
        }

        /// Any strict prefix of a non-empty frame body is rejected
        #[test]
        fn prop_truncated_frame_rejected(
            payload in proptest::collection::vec(any::<u8>(), 1..=512),
            cut in 0usize..512
        ) {
            let frame = encode(&payload).unwrap();
            let keep = LENGTH_PREFIX_LEN + cut % payload.len();
            let result = decode(&frame[..keep]);
            let is_invalid_len = matches!(result, Err(BrokerError::InvalidMsgLength { .. }));
            prop_assert!(is_invalid_len);
        }
    }
}

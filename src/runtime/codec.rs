//! Length-prefixed frame codec.
//!
//! Every message on the wire is a 4-byte unsigned length followed by exactly
//! that many payload bytes:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (4 B) | payload (len bytes)       |
//! +----------------+---------------------------+
//! ```
//!
//! The payload is capped at [`MAX_PAYLOAD`]. A peer announcing a larger frame
//! is violating the protocol; the decoder reports that as [`Decoded::Invalid`]
//! and the connection is torn down.
//!
//! The codec never performs I/O. It only inspects the bytes it is given and
//! reports how many of them a frame occupies.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use thiserror::Error;

/// Size of the length header.
pub const HEADER_LEN: usize = 4;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 4096;

/// Largest encoded frame (header plus payload).
pub const MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD;

/// Byte order of the length header.
///
/// Both peers must agree. `Native` follows whatever the host uses, which is
/// only interoperable between hosts of the same endianness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
    Native,
}

impl ByteOrder {
    fn to_bytes(self, len: u32) -> [u8; HEADER_LEN] {
        match self {
            ByteOrder::Little => len.to_le_bytes(),
            ByteOrder::Big => len.to_be_bytes(),
            ByteOrder::Native => len.to_ne_bytes(),
        }
    }

    fn from_bytes(self, header: [u8; HEADER_LEN]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(header),
            ByteOrder::Big => u32::from_be_bytes(header),
            ByteOrder::Native => u32::from_ne_bytes(header),
        }
    }
}

/// Encoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Outcome of trying to pull one frame off the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// A complete frame. `consumed` bytes should be dropped from the buffer.
    Frame { payload: &'a [u8], consumed: usize },
    /// Not enough bytes yet.
    Incomplete,
    /// The header declares a payload larger than [`MAX_PAYLOAD`].
    Invalid { declared: usize },
}

/// Stateless frame encoder/decoder for a given header byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCodec {
    order: ByteOrder,
}

impl FrameCodec {
    pub fn new(order: ByteOrder) -> Self {
        Self { order }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Encode `payload` as a standalone frame.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.encode_into(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Append the frame for `payload` to `dst`.
    ///
    /// `dst` is left untouched on error.
    pub fn encode_into(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = check_len(payload.len())?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(&self.order.to_bytes(len));
        dst.put_slice(payload);
        Ok(())
    }

    /// Try to decode one frame from the front of `buf`.
    pub fn try_decode<'a>(&self, buf: &'a [u8]) -> Decoded<'a> {
        let Some(header) = buf.first_chunk::<HEADER_LEN>() else {
            return Decoded::Incomplete;
        };

        let declared = self.order.from_bytes(*header) as usize;
        if declared > MAX_PAYLOAD {
            return Decoded::Invalid { declared };
        }

        let consumed = HEADER_LEN + declared;
        if buf.len() < consumed {
            return Decoded::Incomplete;
        }

        Decoded::Frame {
            payload: &buf[HEADER_LEN..consumed],
            consumed,
        }
    }

    /// Read the payload length out of a complete header.
    ///
    /// Used by blocking readers that fetch the header and payload separately.
    pub fn declared_len(&self, header: [u8; HEADER_LEN]) -> usize {
        self.order.from_bytes(header) as usize
    }
}

fn check_len(len: usize) -> Result<u32, CodecError> {
    if len > MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD,
        });
    }
    // MAX_PAYLOAD fits in a u32
    Ok(len as u32)
}

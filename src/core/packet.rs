//! Frame envelope and header parsing.
//!
//! [`find_head`] and [`PacketHeader::parse`] are pure: they inspect a byte slice
//! and report what they found without consuming anything. The codec decides when
//! to advance.

use bytes::{BufMut, BytesMut};

use crate::config::{HEADER_LEN, MAGIC_BYTES, MAX_FRAME_SIZE};
use crate::error::{ProtocolError, Result};
use crate::utils::buffer_pool::PooledBuffer;

/// Type code of the keep-alive frame
pub const HEARTBEAT_TYPE_CODE: i32 = 0;
/// Type code of the connection negotiation frame
pub const NEGOTIATE_TYPE_CODE: i32 = 1;

/// Decoded header fields following the magic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub type_code: i32,
    pub length: i32,
}

/// Offset of the first complete magic sequence in `src`.
#[inline]
pub fn find_head(src: &[u8]) -> Option<usize> {
    src.windows(MAGIC_BYTES.len())
        .position(|window| window == MAGIC_BYTES)
}

/// Bytes at the tail of `src` that could be the start of a magic split across reads
pub fn partial_magic_suffix(src: &[u8]) -> usize {
    (1..MAGIC_BYTES.len())
        .rev()
        .find(|&n| src.len() >= n && src[src.len() - n..] == MAGIC_BYTES[..n])
        .unwrap_or(0)
}

impl PacketHeader {
    /// Parse the header at the start of `src`.
    ///
    /// Returns `Ok(None)` when fewer than [`HEADER_LEN`] bytes are present and
    /// [`ProtocolError::InvalidHeader`] when `src` does not start with the magic.
    pub fn parse(src: &[u8]) -> Result<Option<Self>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[..MAGIC_BYTES.len()] != MAGIC_BYTES {
            return Err(ProtocolError::InvalidHeader);
        }
        let field = |at: usize| i32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]]);
        Ok(Some(Self {
            type_code: field(4),
            length: field(8),
        }))
    }

    /// Payload length, checked against `max_frame_size`
    pub fn payload_len(&self, max_frame_size: usize) -> Result<usize> {
        let len = usize::try_from(self.length).map_err(|_| ProtocolError::InvalidHeader)?;
        if len > max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        Ok(len)
    }

    /// Write magic, type code and length. Always writes all three fields.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_slice(&MAGIC_BYTES);
        dst.put_i32_le(self.type_code);
        dst.put_i32_le(self.length);
    }
}

/// One owned message unit. Dropping the frame releases its payload buffer.
#[derive(Debug)]
pub struct Frame {
    pub type_code: i32,
    pub payload: PooledBuffer,
}

impl Frame {
    pub fn new(type_code: i32, payload: PooledBuffer) -> Self {
        Self { type_code, payload }
    }

    /// A frame carrying no payload
    pub fn empty(type_code: i32) -> Self {
        Self {
            type_code,
            payload: PooledBuffer::detached(0),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.type_code == HEARTBEAT_TYPE_CODE
    }

    /// Header describing this frame's unread payload, refusing payloads over `max_frame_size`
    pub fn header(&self, max_frame_size: usize) -> Result<PacketHeader> {
        let len = self.payload.remaining();
        let length = i32::try_from(len)
            .ok()
            .filter(|_| len <= max_frame_size)
            .ok_or(ProtocolError::OversizedPacket(len))?;
        Ok(PacketHeader {
            type_code: self.type_code,
            length,
        })
    }

    /// Size on the wire including the header
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.remaining()
    }

    /// Serialize into a standalone byte vector, bounded by [`MAX_FRAME_SIZE`]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut dst = BytesMut::with_capacity(self.wire_len());
        self.header(MAX_FRAME_SIZE)?.write_to(&mut dst);
        dst.extend_from_slice(self.payload.unread());
        Ok(dst.to_vec())
    }
}

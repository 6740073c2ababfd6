//! Tokio codec for linkwire frames.
//!
//! Used with `Framed` for TCP streams and `UdpFramed` for datagrams. Decoded
//! payloads are copied into buffers rented from the link's [`BufferPool`], so
//! the read buffer can be reused as soon as a frame is cut.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

use crate::config::{HEADER_LEN, MAGIC_BYTES, MAX_FRAME_SIZE};
use crate::core::packet::{find_head, partial_magic_suffix, Frame, PacketHeader};
use crate::error::{ProtocolError, Result};
use crate::utils::buffer_pool::BufferPool;

/// Frame codec with magic resynchronization
#[derive(Debug, Clone)]
pub struct FrameCodec {
    pool: BufferPool,
    max_frame_size: usize,
    /// Leading bytes of the read buffer already searched for the magic
    scanned: usize,
}

impl FrameCodec {
    pub fn new(pool: BufferPool, max_frame_size: usize) -> Self {
        Self {
            pool,
            max_frame_size,
            scanned: 0,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(BufferPool::default(), MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let from = self.scanned.min(src.len());
        match find_head(&src[from..]).map(|at| from + at) {
            None => {
                // A magic split across reads can still start in the last few bytes
                self.scanned = src.len().saturating_sub(MAGIC_BYTES.len() - 1);
                // No magic yet: keep buffering, but not forever
                if src.len() > self.max_frame_size + HEADER_LEN {
                    warn!(buffered = src.len(), "No frame magic in stream");
                    return Err(ProtocolError::InvalidHeader);
                }
                return Ok(None);
            }
            Some(0) => self.scanned = 0,
            Some(offset) => {
                self.scanned = 0;
                warn!(skipped = offset, "Discarding bytes before frame magic");
                src.advance(offset);
            }
        }

        let Some(header) = PacketHeader::parse(src)? else {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        };
        let len = header.payload_len(self.max_frame_size)?;

        if src.len() < HEADER_LEN + len {
            // Partial payload: wait for the rest
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        let buffer = self.pool.rent_from(&payload);

        trace!(type_code = header.type_code, bytes = len, "Decoded frame");
        Ok(Some(Frame::new(header.type_code, buffer)))
    }

    /// Called with a whole datagram by `UdpFramed` and with the tail of a closed
    /// stream by `Framed`. Nothing more can arrive for `src`, so an error
    /// discards it.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src) {
            Err(e) => {
                debug!(discarded = src.len(), error = %e, "Dropping undecodable input");
                src.clear();
                self.scanned = 0;
                Err(e)
            }
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                if !src.is_empty() {
                    // Truncated trailer; a magic prefix cannot complete after EOF either
                    debug!(
                        discarded = src.len(),
                        partial_magic = partial_magic_suffix(src),
                        "Dropping incomplete frame at end of input"
                    );
                    src.clear();
                    self.scanned = 0;
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let header = frame.header(self.max_frame_size)?;
        header.write_to(dst);
        dst.extend_from_slice(frame.payload.unread());
        trace!(type_code = frame.type_code, bytes = header.length, "Encoded frame");
        Ok(())
    }
}

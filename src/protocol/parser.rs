//! `Serialize<T>` / `Deserialize<T>` facade over the resolver and buffer pool.

use std::sync::Arc;

use crate::core::packet::Frame;
use crate::error::{ProtocolError, Result};
use crate::formatter::FormatterResolver;
use crate::protocol::message::{Message, NetworkPacket};
use crate::utils::buffer_pool::{BufferPool, PooledBuffer};

/// Serializes values through registered formatters into pooled buffers
#[derive(Debug, Clone)]
pub struct BinaryParser {
    resolver: Arc<FormatterResolver>,
    pool: BufferPool,
}

impl BinaryParser {
    pub fn new(resolver: Arc<FormatterResolver>, pool: BufferPool) -> Self {
        Self { resolver, pool }
    }

    pub fn resolver(&self) -> &FormatterResolver {
        &self.resolver
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Encode `value` into a rented buffer
    pub fn serialize<T: 'static>(&self, value: &T) -> Result<PooledBuffer> {
        let formatter = self.resolver.get_with_verify::<T>()?;
        let mut buf = self.pool.rent();
        formatter.serialize(value, &mut buf)?;
        Ok(buf)
    }

    /// Decode a `T` that must occupy all of `bytes`
    pub fn deserialize<T: 'static>(&self, bytes: &[u8]) -> Result<T> {
        let mut buf = self.pool.rent_from(bytes);
        self.deserialize_from(&mut buf)
    }

    /// Decode a `T` that must occupy all unread bytes of `buf`
    pub fn deserialize_from<T: 'static>(&self, buf: &mut PooledBuffer) -> Result<T> {
        let value = self.resolver.deserialize::<T>(buf)?;
        if !buf.is_empty() {
            return Err(ProtocolError::InvalidData(format!(
                "{} trailing bytes after {}",
                buf.remaining(),
                std::any::type_name::<T>()
            )));
        }
        Ok(value)
    }

    /// Encode a message into a frame tagged with its type code
    pub fn to_frame<T: Message>(&self, value: &T) -> Result<Frame> {
        Ok(Frame::new(T::TYPE_CODE, self.serialize(value)?))
    }

    /// Decode a frame's payload as `T`
    pub fn from_frame<T: Message>(&self, frame: &mut Frame) -> Result<T> {
        if frame.type_code != T::TYPE_CODE {
            return Err(ProtocolError::UnexpectedMessage(frame.type_code));
        }
        self.deserialize_from(&mut frame.payload)
    }

    /// Wrap a message in a [`NetworkPacket`]
    pub fn pack<T: Message>(&self, value: &T) -> Result<NetworkPacket> {
        let buf = self.serialize(value)?;
        Ok(NetworkPacket {
            type_code: T::TYPE_CODE,
            bytes: buf.unread_bytes(),
        })
    }

    /// Unwrap a [`NetworkPacket`] holding a `T`
    pub fn unpack<T: Message>(&self, packet: &NetworkPacket) -> Result<T> {
        if packet.type_code != T::TYPE_CODE {
            return Err(ProtocolError::UnexpectedMessage(packet.type_code));
        }
        self.deserialize(&packet.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::ResolverBuilder;
    use crate::protocol::message::Negotiate;

    #[allow(clippy::unwrap_used)]
    fn parser() -> BinaryParser {
        let mut builder = ResolverBuilder::with_builtins().unwrap();
        crate::protocol::register_formatters(&mut builder).unwrap();
        BinaryParser::new(Arc::new(builder.build().unwrap()), BufferPool::default())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_pack_unpack() {
        let parser = parser();
        let negotiate = Negotiate {
            need_heartbeat: true,
            heartbeat_interval_ms: 250,
        };
        let packet = parser.pack(&negotiate).unwrap();
        assert_eq!(packet.type_code, Negotiate::TYPE_CODE);
        assert_eq!(parser.unpack::<Negotiate>(&packet).unwrap(), negotiate);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_wrong_type_code_rejected() {
        let parser = parser();
        let packet = NetworkPacket {
            type_code: 12345,
            bytes: bytes::Bytes::new(),
        };
        assert!(matches!(
            parser.unpack::<Negotiate>(&packet),
            Err(ProtocolError::UnexpectedMessage(12345))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let parser = parser();
        assert!(matches!(
            parser.deserialize::<u8>(&[1, 2]),
            Err(ProtocolError::InvalidData(_))
        ));
    }

    #[test]
    fn test_unregistered_type_fails_fast() {
        let parser = parser();
        assert!(matches!(
            parser.serialize(&vec![1.5f32]),
            Err(ProtocolError::MissingFormatter(_))
        ));
    }
}

//! Message type codes and the control messages every link understands.

use bytes::Bytes;

use crate::core::packet::{HEARTBEAT_TYPE_CODE, NEGOTIATE_TYPE_CODE};
use crate::error::Result;
use crate::formatter::builtin::read_array;
use crate::formatter::Formatter;
use crate::utils::buffer_pool::PooledBuffer;

/// 32-bit FNV-1a
pub const fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    hash
}

/// Type code for a full type name. Never returns a reserved control code.
pub const fn type_code_of(name: &str) -> i32 {
    let code = fnv1a_32(name.as_bytes()) as i32;
    if code == HEARTBEAT_TYPE_CODE || code == NEGOTIATE_TYPE_CODE {
        code + 2
    } else {
        code
    }
}

/// A value that travels as the payload of one frame.
///
/// ```rust
/// use linkwire::protocol::message::{type_code_of, Message};
///
/// struct Chat;
/// impl Message for Chat {
///     const TYPE_NAME: &'static str = "app.Chat";
/// }
/// assert_eq!(Chat::TYPE_CODE, type_code_of("app.Chat"));
/// ```
pub trait Message: Send + Sync + 'static {
    /// Stable, fully qualified name of the type
    const TYPE_NAME: &'static str;
    /// Code written in the frame header
    const TYPE_CODE: i32 = type_code_of(Self::TYPE_NAME);
}

/// Generic envelope: a type code and the encoded value.
///
/// Wire layout: `type_code(i32) | bytes`, where `bytes` runs to the end of the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPacket {
    pub type_code: i32,
    pub bytes: Bytes,
}

impl Message for NetworkPacket {
    const TYPE_NAME: &'static str = "linkwire.NetworkPacket";
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkPacketFormatter;

impl Formatter<NetworkPacket> for NetworkPacketFormatter {
    fn serialize(&self, value: &NetworkPacket, buf: &mut PooledBuffer) -> Result<()> {
        buf.write_slice(&value.type_code.to_le_bytes());
        buf.write_slice(&value.bytes);
        Ok(())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<NetworkPacket> {
        let type_code = i32::from_le_bytes(read_array(buf)?);
        let bytes = Bytes::copy_from_slice(buf.read_to_end());
        Ok(NetworkPacket { type_code, bytes })
    }
}

/// First frame a dialing link sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiate {
    pub need_heartbeat: bool,
    pub heartbeat_interval_ms: u32,
}

impl Message for Negotiate {
    const TYPE_NAME: &'static str = "linkwire.Negotiate";
    const TYPE_CODE: i32 = NEGOTIATE_TYPE_CODE;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiateFormatter;

impl Formatter<Negotiate> for NegotiateFormatter {
    fn serialize(&self, value: &Negotiate, buf: &mut PooledBuffer) -> Result<()> {
        buf.write_slice(&[u8::from(value.need_heartbeat)]);
        buf.write_slice(&value.heartbeat_interval_ms.to_le_bytes());
        Ok(())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<Negotiate> {
        let [flag] = read_array::<1>(buf)?;
        Ok(Negotiate {
            need_heartbeat: flag != 0,
            heartbeat_interval_ms: u32::from_le_bytes(read_array(buf)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn test_control_codes_reserved() {
        assert_eq!(Negotiate::TYPE_CODE, NEGOTIATE_TYPE_CODE);
        assert_ne!(NetworkPacket::TYPE_CODE, HEARTBEAT_TYPE_CODE);
        assert_ne!(NetworkPacket::TYPE_CODE, NEGOTIATE_TYPE_CODE);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_packet_bytes_run_to_end() {
        let packet = NetworkPacket {
            type_code: 77,
            bytes: Bytes::from_static(b"body"),
        };
        let mut buf = PooledBuffer::detached(16);
        NetworkPacketFormatter.serialize(&packet, &mut buf).unwrap();
        assert_eq!(buf.remaining(), 8);
        assert_eq!(NetworkPacketFormatter.deserialize(&mut buf).unwrap(), packet);
    }
}

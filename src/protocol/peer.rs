//! Remote endpoint identity.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{ProtocolError, Result};
use crate::formatter::builtin::read_array;
use crate::formatter::Formatter;
use crate::utils::buffer_pool::PooledBuffer;

/// Length of a [`PeerId`] in bytes
pub const PEER_ID_LEN: usize = 20;

/// Opaque 20-byte peer identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// A random identity
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; PEER_ID_LEN] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidData(format!(
                "peer id must be {PEER_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{b:02x}"))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// IPv4 address and port of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    ip: Ipv4Addr,
    port: u16,
}

impl PeerAddress {
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl TryFrom<SocketAddr> for PeerAddress {
    type Error = ProtocolError;

    fn try_from(addr: SocketAddr) -> Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => Err(ProtocolError::InvalidData(format!(
                "peer addresses are IPv4, got {v6}"
            ))),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Raw 20 bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerIdFormatter;

impl Formatter<PeerId> for PeerIdFormatter {
    fn serialize(&self, value: &PeerId, buf: &mut PooledBuffer) -> Result<()> {
        buf.write_slice(value.as_bytes());
        Ok(())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<PeerId> {
        Ok(PeerId(read_array(buf)?))
    }
}

/// Four address octets followed by the port (LE)
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerAddressFormatter;

impl Formatter<PeerAddress> for PeerAddressFormatter {
    fn serialize(&self, value: &PeerAddress, buf: &mut PooledBuffer) -> Result<()> {
        buf.write_slice(&value.ip.octets());
        buf.write_slice(&value.port.to_le_bytes());
        Ok(())
    }

    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<PeerAddress> {
        let ip = Ipv4Addr::from(read_array::<4>(buf)?);
        let port = u16::from_le_bytes(read_array(buf)?);
        Ok(PeerAddress::new(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn test_from_slice_checks_length() {
        assert!(PeerId::from_slice(&[0u8; 19]).is_err());
        assert!(PeerId::from_slice(&[0u8; 20]).is_ok());
    }

    #[test]
    fn test_display_is_hex() {
        let id = PeerId::new([0xAB; PEER_ID_LEN]);
        assert_eq!(id.to_string(), "ab".repeat(PEER_ID_LEN));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_address_wire_layout() {
        let addr = PeerAddress::new(Ipv4Addr::new(10, 0, 0, 7), 6881);
        let mut buf = PooledBuffer::detached(8);
        PeerAddressFormatter.serialize(&addr, &mut buf).unwrap();
        assert_eq!(buf.unread(), &[10, 0, 0, 7, 0xE1, 0x1A]);
        assert_eq!(PeerAddressFormatter.deserialize(&mut buf).unwrap(), addr);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_ipv6_rejected() {
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(PeerAddress::try_from(v6).is_err());
    }
}

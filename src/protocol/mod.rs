//! # Protocol Layer
//!
//! Message identity, handler dispatch and the middleware pipeline.
//!
//! ## Components
//! - **Message**: type names, FNV-1a type codes, control messages
//! - **Dispatcher**: type code to handler routing
//! - **Middleware**: inbound/outbound payload interception
//! - **Parser**: `serialize`/`deserialize` facade for higher-level packets
//! - **Peer**: peer identity and address

pub mod dispatcher;
pub mod message;
pub mod middleware;
pub mod parser;
pub mod peer;

use crate::error::Result;
use crate::formatter::ResolverBuilder;

/// Register formatters for peer identities and the control messages
pub fn register_formatters(builder: &mut ResolverBuilder) -> Result<()> {
    builder
        .register_formatter::<peer::PeerId, _>(peer::PeerIdFormatter)?
        .register_formatter::<peer::PeerAddress, _>(peer::PeerAddressFormatter)?
        .register_formatter::<message::Negotiate, _>(message::NegotiateFormatter)?
        .register_formatter::<message::NetworkPacket, _>(message::NetworkPacketFormatter)?;
    Ok(())
}

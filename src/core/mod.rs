//! # Core Protocol Components
//!
//! Wire-level framing shared by every transport.
//!
//! ## Components
//! - **Packet**: frame header, magic scan and the owned [`packet::Frame`]
//! - **Codec**: Tokio codec for framing over byte streams and datagrams
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [TypeCode(4, LE)] [Length(4, LE)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB by default (prevents memory exhaustion)
//! - Magic bytes resynchronize a reader that joined mid-stream
//! - Length validation before allocation

pub mod codec;
pub mod packet;

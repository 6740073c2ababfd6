//! # linkwire
//!
//! A framed binary wire protocol.
//!
//! - **Buffers**: pooled read/write byte cursors (`PooledBuffer`) over a bounded object pool
//! - **Formatters**: a type-indexed codec registry built once at startup (`FormatterResolver`)
//! - **Framing**: `magic | type_code | length | payload` frames with magic resynchronization
//! - **Linker**: a pipelined TCP/UDP endpoint with middleware, dispatch and heartbeat
//! - **Splitter**: chunked file transfer with idempotent, out-of-order reassembly
//!
//! ## Quick start
//! ```rust,no_run
//! use linkwire::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> linkwire::Result<()> {
//!     let context = LinkContext::builder(NetworkConfig::default()).build()?;
//!     let linker = Linker::connect(context, "127.0.0.1:9400").await?;
//!     let packet = NetworkPacket {
//!         type_code: 7,
//!         bytes: PeerId::random().as_bytes().to_vec().into(),
//!     };
//!     linker.send(&packet).await?;
//!     linker.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod formatter;
pub mod protocol;
pub mod splitter;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::config::NetworkConfig;
    pub use crate::core::packet::{Frame, PacketHeader};
    pub use crate::error::{ProtocolError, Result};
    pub use crate::formatter::{Formatter, FormatterResolver, ResolverBuilder, VersionData};
    pub use crate::protocol::message::{Message, NetworkPacket};
    pub use crate::protocol::parser::BinaryParser;
    pub use crate::protocol::peer::{PeerAddress, PeerId};
    pub use crate::splitter::{
        DirectoryPathResolver, FileAssembler, FileSegmenter, SplitterDto, SplitterInfo, TransferOutcome,
    };
    pub use crate::transport::{LinkContext, Linker, LinkerListener, LinkerState};
    pub use crate::utils::{BufferPool, PooledBuffer};
}

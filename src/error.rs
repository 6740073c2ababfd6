//! # Error Types
//!
//! Error handling for the wire protocol stack.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ProtocolError`]. Variants are grouped by where they originate.
//!
//! ## Error Categories
//! - **Codec resolution**: no formatter, duplicate or cyclic registrations
//! - **Framing**: corrupt headers, oversized frames, short buffers
//! - **Resource exclusivity**: a resource key already checked out
//! - **Disposed access**: operations on closed links or shut-down pools
//! - **Transport**: socket failures, timeouts, cancellation, bad state
//!
//! ## Example Usage
//! ```rust
//! use linkwire::error::{ProtocolError, Result};
//!
//! fn frame_len(claimed: i32) -> Result<usize> {
//!     usize::try_from(claimed).map_err(|_| ProtocolError::InvalidHeader)
//! }
//!
//! assert!(frame_len(-1).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Disposed objects
    pub const ERR_LINKER_CLOSED: &str = "linker";
    pub const ERR_OPERATE_DISPOSED: &str = "concurrent operate";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("No formatter registered for type {0}")]
    MissingFormatter(&'static str),

    #[error("Formatter already registered for {0}")]
    DuplicateFormatter(String),

    #[error("Formatter dependency cycle: {0}")]
    FormatterCycle(String),

    #[error("Formatter for {formatter} requested undeclared dependency {dependency}")]
    UndeclaredDependency {
        formatter: &'static str,
        dependency: &'static str,
    },

    #[error("No formatter version at or below {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Frame too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Buffer underflow: needed {needed} bytes, {available} available")]
    BufferUnderflow { needed: usize, available: usize },

    #[error("Buffer overflow: advanced {requested} bytes, {available} available")]
    BufferOverflow { requested: usize, available: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Use of disposed {0}")]
    Disposed(&'static str),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Invalid linker state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("No handler for type code {0}")]
    UnexpectedMessage(i32),

    #[error("Type code {0} already registered")]
    DuplicateTypeCode(i32),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether the error leaves the byte stream in an unknown position.
    ///
    /// The linker tears the connection down on these instead of skipping the frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidHeader
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::Io(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::ConnectionTimeout
                | ProtocolError::DecompressionFailure
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::InvalidHeader.is_fatal());
        assert!(ProtocolError::OversizedPacket(1 << 30).is_fatal());
        assert!(!ProtocolError::UnexpectedMessage(7).is_fatal());
        assert!(!ProtocolError::ResourceBusy("a".into()).is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = ProtocolError::BufferUnderflow {
            needed: 4,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "Buffer underflow: needed 4 bytes, 1 available"
        );
        assert_eq!(
            ProtocolError::MissingFormatter("u128").to_string(),
            "No formatter registered for type u128"
        );
    }
}

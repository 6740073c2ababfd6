//! # Formatters
//!
//! Type-driven binary codecs over [`PooledBuffer`].
//!
//! A [`Formatter<T>`] encodes exactly one type. Formatters for composite types
//! hold the formatters of their parts, handed to them when the
//! [`FormatterResolver`] is built. Registration happens once, up front, through
//! a [`ResolverBuilder`]. Dependency cycles are rejected while registering,
//! before anything is constructed.
//!
//! ```rust
//! use linkwire::formatter::ResolverBuilder;
//! use linkwire::utils::buffer_pool::PooledBuffer;
//!
//! let mut builder = ResolverBuilder::with_builtins().unwrap();
//! builder.register_vec::<String>().unwrap();
//! let resolver = builder.build().unwrap();
//!
//! let mut buf = PooledBuffer::detached(64);
//! let names = vec!["a".to_string(), "b".to_string()];
//! resolver.serialize(&names, &mut buf).unwrap();
//! assert_eq!(resolver.deserialize::<Vec<String>>(&mut buf).unwrap(), names);
//! ```

pub mod builtin;
pub mod resolver;
pub mod version;

pub use resolver::{BuildContext, FormatterResolver, Registration, ResolverBuilder};
pub use version::VersionData;

use crate::error::Result;
use crate::utils::buffer_pool::PooledBuffer;

/// Binary codec for one type
pub trait Formatter<T>: Send + Sync + 'static {
    /// Append the encoding of `value` at the buffer's write cursor
    fn serialize(&self, value: &T, buf: &mut PooledBuffer) -> Result<()>;

    /// Decode one value from the buffer's read cursor
    fn deserialize(&self, buf: &mut PooledBuffer) -> Result<T>;
}
